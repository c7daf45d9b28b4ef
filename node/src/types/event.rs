use serde::{Deserialize, Serialize};

use crate::utilities::time::now_millis;
use crate::utilities::{generate_entity_id, EntityId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A batch pin was observed on the ordering ledger.
    BatchPinComplete,
    /// A batch payload arrived over data exchange or shared storage.
    MessageArrived,
    /// A blob became locally available.
    BlobReceived,
    MessageConfirmed,
    MessageRejected,
    OperationSucceeded,
    OperationFailed,
    TokenPoolConfirmed,
    TokenTransferConfirmed,
    TokenApprovalConfirmed,
    /// A pin failed an integrity check and was set aside for the operator.
    PinQuarantined,
}

impl EventType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            EventType::BatchPinComplete => "batch_pin_complete",
            EventType::MessageArrived => "message_arrived",
            EventType::BlobReceived => "blob_received",
            EventType::MessageConfirmed => "message_confirmed",
            EventType::MessageRejected => "message_rejected",
            EventType::OperationSucceeded => "operation_succeeded",
            EventType::OperationFailed => "operation_failed",
            EventType::TokenPoolConfirmed => "token_pool_confirmed",
            EventType::TokenTransferConfirmed => "token_transfer_confirmed",
            EventType::TokenApprovalConfirmed => "token_approval_confirmed",
            EventType::PinQuarantined => "pin_quarantined",
        }
    }

    pub(crate) fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "batch_pin_complete" => Ok(EventType::BatchPinComplete),
            "message_arrived" => Ok(EventType::MessageArrived),
            "blob_received" => Ok(EventType::BlobReceived),
            "message_confirmed" => Ok(EventType::MessageConfirmed),
            "message_rejected" => Ok(EventType::MessageRejected),
            "operation_succeeded" => Ok(EventType::OperationSucceeded),
            "operation_failed" => Ok(EventType::OperationFailed),
            "token_pool_confirmed" => Ok(EventType::TokenPoolConfirmed),
            "token_transfer_confirmed" => Ok(EventType::TokenTransferConfirmed),
            "token_approval_confirmed" => Ok(EventType::TokenApprovalConfirmed),
            "pin_quarantined" => Ok(EventType::PinQuarantined),
            other => anyhow::bail!("Unknown event type: {other}"),
        }
    }
}

/// A locally-persisted fact. `sequence` is the canonical node-local total
/// order: it is assigned by event ingress alone, inside the same storage
/// transaction as the state change the event describes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Event {
    pub id: EntityId,
    pub namespace: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Id of the entity this event is about (message, batch, operation, ...).
    pub reference: EntityId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<EntityId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub sequence: i64,
    pub created: u64,
}

impl Event {
    pub(crate) fn new(namespace: &str, event_type: EventType, reference: &EntityId) -> Self {
        Self {
            id: generate_entity_id(),
            namespace: namespace.to_string(),
            event_type,
            reference: reference.clone(),
            tx: None,
            topic: None,
            sequence: 0,
            created: now_millis(),
        }
    }

    pub(crate) fn with_tx(mut self, tx: &EntityId) -> Self {
        self.tx = Some(tx.clone());
        self
    }

    pub(crate) fn with_topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_string());
        self
    }
}
