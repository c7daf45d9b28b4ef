use serde::{Deserialize, Serialize};

use crate::types::{Member, MessageType, SubscriptionFilter, SubscriptionOptions};
use crate::utilities::hash::HashType;
use crate::utilities::EntityId;

/// One data element of a message submission.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataInput {
    /// Inline JSON value, inserted as a new data row.
    Value(serde_json::Value),
    /// Reference to an already-stored data row.
    Ref { id: EntityId },
    /// Reference to a blob already staged with the data-exchange layer.
    Blob { hash: HashType, size: u64 },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupInput {
    #[serde(default)]
    pub name: Option<String>,
    pub members: Vec<Member>,
}

/// An outbound message submission.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmitRequest {
    pub namespace: String,
    pub author: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub topics: Vec<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub cid: Option<EntityId>,
    #[serde(default)]
    pub group: Option<GroupInput>,
    #[serde(default)]
    pub data: Vec<DataInput>,
}

/// Subscription creation payload: everything but the server-assigned fields.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiSubscriptionRequest {
    pub name: String,
    #[serde(default)]
    pub filter: SubscriptionFilter,
    #[serde(default)]
    pub options: SubscriptionOptions,
}
