use serde::{Deserialize, Serialize};

use crate::utilities::time::now_millis;
use crate::utilities::{generate_entity_id, EntityId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    BatchPin,
    TokenPool,
    TokenTransfer,
    TokenApproval,
    NetworkAction,
}

impl TransactionType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            TransactionType::BatchPin => "batch_pin",
            TransactionType::TokenPool => "token_pool",
            TransactionType::TokenTransfer => "token_transfer",
            TransactionType::TokenApproval => "token_approval",
            TransactionType::NetworkAction => "network_action",
        }
    }

    pub(crate) fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "batch_pin" => Ok(TransactionType::BatchPin),
            "token_pool" => Ok(TransactionType::TokenPool),
            "token_transfer" => Ok(TransactionType::TokenTransfer),
            "token_approval" => Ok(TransactionType::TokenApproval),
            "network_action" => Ok(TransactionType::NetworkAction),
            other => anyhow::bail!("Unknown transaction type: {other}"),
        }
    }
}

/// Groups the on-chain and off-chain operations caused by one logical action.
/// `blockchain_ids` accumulates the ledger transaction hashes reported back by
/// the blockchain plugin as the operations complete.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Transaction {
    pub id: EntityId,
    pub namespace: String,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub blockchain_ids: Vec<String>,
    pub created: u64,
}

impl Transaction {
    pub(crate) fn new(namespace: &str, tx_type: TransactionType) -> Self {
        Self {
            id: generate_entity_id(),
            namespace: namespace.to_string(),
            tx_type,
            blockchain_ids: Vec::new(),
            created: now_millis(),
        }
    }
}
