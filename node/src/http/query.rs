use actix_web::web::{Data, Path, Query};
use actix_web::{get, HttpResponse};
use serde::Deserialize;

use crate::api::WeftApi;
use crate::error::CoreError;

/// Map the coded error taxonomy onto HTTP statuses; the body carries the
/// stable code plus message.
pub(crate) fn error_response(err: CoreError) -> HttpResponse {
    let body = serde_json::json!({ "code": err.code(), "error": err.to_string() });
    match &err {
        CoreError::InvalidInput(_) | CoreError::InvalidRef(_) => {
            HttpResponse::BadRequest().json(body)
        }
        CoreError::Unauthorized(_) => HttpResponse::Unauthorized().json(body),
        CoreError::Conflict(_) | CoreError::IdMismatch(_) => HttpResponse::Conflict().json(body),
        CoreError::NotFound(_) => HttpResponse::NotFound().json(body),
        CoreError::RemoteUnavailable(_) => HttpResponse::ServiceUnavailable().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

/// Look up a message, including its local delivery state.
#[utoipa::path(responses(
    (status = 200, description = "The message"),
    (status = 404, description = "Unknown message"),
))]
#[get("/api/v1/messages/{id}")]
pub(crate) async fn message_by_id(api: Data<WeftApi>, path: Path<String>) -> HttpResponse {
    let id = path.into_inner();
    match api.get_message(id.clone()).await {
        Ok(Some(record)) => HttpResponse::Ok().json(serde_json::json!({
            "message": record.message,
            "state": record.state,
            "batch": record.batch,
        })),
        Ok(None) => error_response(CoreError::NotFound(format!("Message {id}"))),
        Err(err) => error_response(err),
    }
}

/// Look up a batch by id.
#[utoipa::path(responses(
    (status = 200, description = "The batch"),
    (status = 404, description = "Unknown batch"),
))]
#[get("/api/v1/batches/{id}")]
pub(crate) async fn batch_by_id(api: Data<WeftApi>, path: Path<String>) -> HttpResponse {
    let id = path.into_inner();
    match api.get_batch(id.clone()).await {
        Ok(Some(record)) => HttpResponse::Ok().json(serde_json::json!({
            "batch": record.batch,
            "sealed": record.sealed,
        })),
        Ok(None) => error_response(CoreError::NotFound(format!("Batch {id}"))),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
pub(crate) struct EventsQuery {
    #[serde(default)]
    from: i64,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Page through the local event stream in sequence order.
#[utoipa::path(responses((status = 200, description = "Events above the given sequence")))]
#[get("/api/v1/events")]
pub(crate) async fn events(api: Data<WeftApi>, query: Query<EventsQuery>) -> HttpResponse {
    match api.get_events(query.from, query.limit).await {
        Ok(events) => HttpResponse::Ok().json(events),
        Err(err) => error_response(err),
    }
}

/// Look up an operation by id.
#[utoipa::path(responses(
    (status = 200, description = "The operation"),
    (status = 404, description = "Unknown operation"),
))]
#[get("/api/v1/operations/{id}")]
pub(crate) async fn operation_by_id(api: Data<WeftApi>, path: Path<String>) -> HttpResponse {
    let id = path.into_inner();
    match api.get_operation(id.clone()).await {
        Ok(Some(op)) => HttpResponse::Ok().json(op),
        Ok(None) => error_response(CoreError::NotFound(format!("Operation {id}"))),
        Err(err) => error_response(err),
    }
}

/// List subscriptions in the node's namespace.
#[utoipa::path(responses((status = 200, description = "All subscriptions")))]
#[get("/api/v1/subscriptions")]
pub(crate) async fn subscriptions(api: Data<WeftApi>) -> HttpResponse {
    match api.list_subscriptions().await {
        Ok(subs) => HttpResponse::Ok().json(subs),
        Err(err) => error_response(err),
    }
}
