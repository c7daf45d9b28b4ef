use clap::Parser;

use weft::cli::{Cli, Subcommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    weft::logging::init_logging();

    let cli = Cli::parse();
    match cli.subcommand {
        Subcommand::Init(init) => init.execute(),
        Subcommand::Run(run) => run.execute().await,
    }
}
