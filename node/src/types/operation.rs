use serde::{Deserialize, Serialize};

use crate::utilities::hash::hash_of;
use crate::utilities::time::now_millis;
use crate::utilities::{generate_entity_id, EntityId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    SharedStorageUploadBatch,
    DataExchangeSendBatch,
    DataExchangeSendBlob,
    BlockchainPinBatch,
    BlockchainNetworkAction,
    TokenCreatePool,
    TokenMint,
    TokenBurn,
    TokenTransfer,
    TokenApproval,
}

impl OpType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            OpType::SharedStorageUploadBatch => "shared_storage_upload_batch",
            OpType::DataExchangeSendBatch => "data_exchange_send_batch",
            OpType::DataExchangeSendBlob => "data_exchange_send_blob",
            OpType::BlockchainPinBatch => "blockchain_pin_batch",
            OpType::BlockchainNetworkAction => "blockchain_network_action",
            OpType::TokenCreatePool => "token_create_pool",
            OpType::TokenMint => "token_mint",
            OpType::TokenBurn => "token_burn",
            OpType::TokenTransfer => "token_transfer",
            OpType::TokenApproval => "token_approval",
        }
    }

    pub(crate) fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "shared_storage_upload_batch" => Ok(OpType::SharedStorageUploadBatch),
            "data_exchange_send_batch" => Ok(OpType::DataExchangeSendBatch),
            "data_exchange_send_blob" => Ok(OpType::DataExchangeSendBlob),
            "blockchain_pin_batch" => Ok(OpType::BlockchainPinBatch),
            "blockchain_network_action" => Ok(OpType::BlockchainNetworkAction),
            "token_create_pool" => Ok(OpType::TokenCreatePool),
            "token_mint" => Ok(OpType::TokenMint),
            "token_burn" => Ok(OpType::TokenBurn),
            "token_transfer" => Ok(OpType::TokenTransfer),
            "token_approval" => Ok(OpType::TokenApproval),
            other => anyhow::bail!("Unknown operation type: {other}"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Initialized,
    Pending,
    Succeeded,
    Failed,
}

impl OpStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            OpStatus::Initialized => "initialized",
            OpStatus::Pending => "pending",
            OpStatus::Succeeded => "succeeded",
            OpStatus::Failed => "failed",
        }
    }

    pub(crate) fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "initialized" => Ok(OpStatus::Initialized),
            "pending" => Ok(OpStatus::Pending),
            "succeeded" => Ok(OpStatus::Succeeded),
            "failed" => Ok(OpStatus::Failed),
            other => anyhow::bail!("Unknown operation status: {other}"),
        }
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, OpStatus::Succeeded | OpStatus::Failed)
    }

    /// Status only ever moves forward: Initialized -> Pending -> terminal.
    pub(crate) fn can_transition_to(self, next: OpStatus) -> bool {
        match (self, next) {
            (OpStatus::Initialized, OpStatus::Pending) => true,
            (OpStatus::Initialized, s) | (OpStatus::Pending, s) if s.is_terminal() => true,
            _ => false,
        }
    }
}

/// A retryable unit of plugin work. At-most-once per idempotency key:
/// (transaction, type, plugin, input hash). A manual retry creates a new row
/// with a new id but the same key, which the plugin may use to short-circuit.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Operation {
    pub id: EntityId,
    pub namespace: String,
    pub tx: EntityId,
    #[serde(rename = "type")]
    pub op_type: OpType,
    pub plugin: String,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    pub status: OpStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub created: u64,
    pub updated: u64,
}

impl Operation {
    pub(crate) fn new(
        namespace: &str,
        tx: &EntityId,
        op_type: OpType,
        plugin: &str,
        input: serde_json::Value,
    ) -> Self {
        let now = now_millis();
        Self {
            id: generate_entity_id(),
            namespace: namespace.to_string(),
            tx: tx.clone(),
            op_type,
            plugin: plugin.to_string(),
            input,
            output: None,
            status: OpStatus::Initialized,
            error: None,
            retry_count: 0,
            created: now,
            updated: now,
        }
    }

    pub(crate) fn idempotency_key(&self) -> anyhow::Result<String> {
        let input_hash = hash_of(&self.input)?;
        Ok(format!(
            "{}:{}:{}:{}",
            self.tx,
            self.op_type.as_str(),
            self.plugin,
            input_hash.hex()
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_transitions_monotonic() {
        assert!(OpStatus::Initialized.can_transition_to(OpStatus::Pending));
        assert!(OpStatus::Pending.can_transition_to(OpStatus::Succeeded));
        assert!(OpStatus::Pending.can_transition_to(OpStatus::Failed));
        assert!(!OpStatus::Succeeded.can_transition_to(OpStatus::Pending));
        assert!(!OpStatus::Failed.can_transition_to(OpStatus::Succeeded));
        assert!(!OpStatus::Pending.can_transition_to(OpStatus::Initialized));
    }

    #[test]
    fn test_idempotency_key_ignores_id() {
        let input = serde_json::json!({"batch": "b1"});
        let tx = "tx-1".to_string();
        let op1 = Operation::new("ns1", &tx, OpType::BlockchainPinBatch, "chain", input.clone());
        let op2 = Operation::new("ns1", &tx, OpType::BlockchainPinBatch, "chain", input);
        assert_ne!(op1.id, op2.id);
        assert_eq!(
            op1.idempotency_key().unwrap(),
            op2.idempotency_key().unwrap()
        );
    }

    #[test]
    fn test_idempotency_key_covers_input() {
        let tx = "tx-1".to_string();
        let op1 = Operation::new(
            "ns1",
            &tx,
            OpType::BlockchainPinBatch,
            "chain",
            serde_json::json!({"batch": "b1"}),
        );
        let op2 = Operation::new(
            "ns1",
            &tx,
            OpType::BlockchainPinBatch,
            "chain",
            serde_json::json!({"batch": "b2"}),
        );
        assert_ne!(
            op1.idempotency_key().unwrap(),
            op2.idempotency_key().unwrap()
        );
    }
}
