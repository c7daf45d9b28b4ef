//! Logging setup

const DEFAULT_DIRECTIVES: &str = "info,weft=debug";

pub fn init_logging() {
    let directives =
        ::std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_DIRECTIVES.to_string());
    println!("Logging with directives: {directives}");
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&directives)
        .format_timestamp_millis()
        .init();
}
