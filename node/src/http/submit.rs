use actix_web::web::{Data, Json, Path};
use actix_web::{post, HttpResponse};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::types::{ApiSubscriptionRequest, DataInput, GroupInput, SubmitRequest};
use crate::api::WeftApi;
use crate::error::CoreError;
use crate::types::{Member, MessageType};

use super::query::error_response;

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub(crate) struct GroupMemberInput {
    pub org: String,
    pub node: String,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub(crate) struct MessageSubmitRequest {
    pub namespace: String,
    pub author: String,
    /// broadcast | private | transfer_broadcast | transfer_private | definition
    #[serde(rename = "type")]
    pub message_type: String,
    pub topics: Vec<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub cid: Option<String>,
    /// Private group members.
    #[serde(default)]
    pub group: Option<Vec<GroupMemberInput>>,
    /// Inline JSON data values.
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub data: Vec<serde_json::Value>,
    /// References to existing data rows.
    #[serde(default)]
    pub data_refs: Vec<String>,
}

impl MessageSubmitRequest {
    fn into_submit(self) -> Result<SubmitRequest, CoreError> {
        let message_type = MessageType::parse(&self.message_type)
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;

        let mut data: Vec<DataInput> = self.data.into_iter().map(DataInput::Value).collect();
        data.extend(self.data_refs.into_iter().map(|id| DataInput::Ref { id }));

        Ok(SubmitRequest {
            namespace: self.namespace,
            author: self.author,
            message_type,
            topics: self.topics,
            tag: self.tag,
            cid: self.cid,
            group: self.group.map(|members| GroupInput {
                name: None,
                members: members
                    .into_iter()
                    .map(|m| Member {
                        org: m.org,
                        node: m.node,
                    })
                    .collect(),
            }),
            data,
        })
    }
}

/// Submit a message for ordered delivery to the network.
#[utoipa::path(
    request_body = MessageSubmitRequest,
    responses(
        (status = 202, description = "Message staged for batching"),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Author is not a local identity"),
    )
)]
#[post("/api/v1/messages")]
pub(crate) async fn submit_message(
    api: Data<WeftApi>,
    body: Json<MessageSubmitRequest>,
) -> HttpResponse {
    let request = match body.into_inner().into_submit() {
        Ok(request) => request,
        Err(err) => return error_response(err),
    };
    match api.submit_message(request).await {
        Ok(message) => HttpResponse::Accepted().json(message),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub(crate) struct SubscriptionCreateRequest {
    pub name: String,
    /// Event type names to deliver; empty for all.
    #[serde(default)]
    pub events: Vec<String>,
    /// Topics to deliver; empty for all.
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Create a named subscription over the local event stream.
#[utoipa::path(
    request_body = SubscriptionCreateRequest,
    responses(
        (status = 201, description = "Subscription created"),
        (status = 409, description = "Name already in use"),
    )
)]
#[post("/api/v1/subscriptions")]
pub(crate) async fn create_subscription(
    api: Data<WeftApi>,
    body: Json<SubscriptionCreateRequest>,
) -> HttpResponse {
    let body = body.into_inner();
    let mut events = Vec::new();
    for name in &body.events {
        match crate::types::EventType::parse(name) {
            Ok(event_type) => events.push(event_type),
            Err(err) => return error_response(CoreError::InvalidInput(err.to_string())),
        }
    }

    let request = ApiSubscriptionRequest {
        name: body.name,
        filter: crate::types::SubscriptionFilter {
            events,
            topics: body.topics,
            author: body.author,
            tag: body.tag,
        },
        options: Default::default(),
    };
    match api.create_subscription(request).await {
        Ok(sub) => HttpResponse::Created().json(sub),
        Err(err) => error_response(err),
    }
}

/// Retry a failed operation under the same idempotency key.
#[utoipa::path(
    responses(
        (status = 202, description = "Retry accepted"),
        (status = 404, description = "Unknown operation"),
        (status = 409, description = "Operation is not in a failed state"),
    )
)]
#[post("/api/v1/operations/{id}/retry")]
pub(crate) async fn retry_operation(api: Data<WeftApi>, path: Path<String>) -> HttpResponse {
    match api.retry_operation(path.into_inner()).await {
        Ok(op) => HttpResponse::Accepted().json(op),
        Err(err) => error_response(err),
    }
}
