//! An HTTP server allowing messages to be submitted and node state queried.
//! Includes Swagger documentation for the API.

pub(crate) mod query;
pub(crate) mod submit;

use actix_web::dev::Server;
use actix_web::web::Data;
use actix_web::{App, HttpServer};
use anyhow::Result;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::WeftApi;
use crate::config::HttpConfig;

/// Starts the HTTP server.
pub(crate) fn start(config: &HttpConfig, api: WeftApi) -> Result<Server> {
    print_startup_messages(config);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(api.clone()))
            .service(submit::submit_message)
            .service(submit::create_subscription)
            .service(submit::retry_operation)
            .service(query::message_by_id)
            .service(query::batch_by_id)
            .service(query::events)
            .service(query::operation_by_id)
            .service(query::subscriptions)
            .service(swagger_ui())
    })
    .bind(&config.address)?
    .run();
    Ok(server)
}

/// Builds the Swagger UI.
///
/// Note that all routes you want Swagger docs for must be in the `paths`
/// annotation.
fn swagger_ui() -> SwaggerUi {
    #[derive(OpenApi)]
    #[openapi(
        paths(
            submit::submit_message,
            submit::create_subscription,
            submit::retry_operation,
            query::message_by_id,
            query::batch_by_id,
            query::events,
            query::operation_by_id,
            query::subscriptions,
        ),
        components(schemas(
            submit::MessageSubmitRequest,
            submit::GroupMemberInput,
            submit::SubscriptionCreateRequest,
        ))
    )]
    struct ApiDoc;
    SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-doc/openapi.json", ApiDoc::openapi())
}

/// Prints which address HTTP is running on, and some helpful pointers to the
/// Swagger UI and OpenAPI spec.
fn print_startup_messages(config: &HttpConfig) {
    log::info!("Server running on {}", config.address);
    log::info!("Swagger UI: {}/swagger-ui/", config.address);
    log::info!("OpenAPI spec is at: {}/api-doc/openapi.json", config.address);
}
