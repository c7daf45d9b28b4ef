use async_trait::async_trait;

use crate::types::{BatchType, Group, TxRef};
use crate::utilities::hash::HashType;
use crate::utilities::EntityId;

use super::PluginResult;

/// Batch identity shipped alongside the canonical payload bytes on
/// point-to-point transfers, so the receiver can reconstruct the batch row
/// without parsing anything out of the payload itself.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub(crate) struct BatchMeta {
    pub id: EntityId,
    pub namespace: String,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<HashType>,
    /// Member list for the group hash above, carried so receivers can
    /// validate signers without a separate group exchange.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_definition: Option<Group>,
    #[serde(rename = "type")]
    pub batch_type: BatchType,
    pub hash: HashType,
    pub created: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<TxRef>,
}

/// A batch in transit: identity plus the canonical payload encoding.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BatchEnvelope {
    pub meta: BatchMeta,
    pub payload: Vec<u8>,
}

#[async_trait]
pub(crate) trait DataExchangePlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Push a sealed batch to one peer node. Idempotent on the key.
    async fn send_batch(
        &self,
        peer: &str,
        envelope: &BatchEnvelope,
        idempotency_key: &str,
    ) -> PluginResult<()>;

    /// Push a locally-present blob to one peer node. Idempotent on the key.
    async fn transfer_blob(
        &self,
        peer: &str,
        hash: &HashType,
        idempotency_key: &str,
    ) -> PluginResult<()>;

    /// Ask a peer to (re)send a blob we are missing.
    async fn request_blob(&self, peer: &str, hash: &HashType) -> PluginResult<()>;

    /// Ask a peer to (re)send a batch payload we are missing.
    async fn request_batch(&self, peer: &str, namespace: &str, batch_id: &str)
        -> PluginResult<()>;
}
