use async_trait::async_trait;

use crate::utilities::hash::HashType;
use crate::utilities::EntityId;

use super::{OpPollStatus, PluginResult};

/// One contexts[] entry of a batch pin: context hash plus the nonce assigned
/// at seal. Wire form is contextHash || bigEndianNonce.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PinnedContext {
    pub context: HashType,
    pub nonce: u64,
}

impl PinnedContext {
    pub(crate) fn to_wire(&self) -> String {
        format!("{}{}", self.context.hex(), hex::encode(self.nonce.to_be_bytes()))
    }

    pub(crate) fn from_wire(wire: &str) -> anyhow::Result<Self> {
        if wire.len() != 80 {
            anyhow::bail!("Pinned context must be 40 bytes of hex, got {}", wire.len());
        }
        let context = HashType::from_hex(&wire[..64])?;
        let nonce_bytes: [u8; 8] = hex::decode(&wire[64..])?
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid nonce bytes"))?;
        Ok(Self {
            context,
            nonce: u64::from_be_bytes(nonce_bytes),
        })
    }
}

/// What goes into the ledger transaction for one sealed batch.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BatchPin {
    pub namespace: String,
    pub batch_id: EntityId,
    pub batch_hash: HashType,
    /// Shared-storage download reference; absent for private batches.
    pub payload_ref: Option<String>,
    pub contexts: Vec<PinnedContext>,
}

/// A pin observed on the ledger, in ledger order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BatchPinEvent {
    pub pin: BatchPin,
    /// Ledger signing address that submitted the pin.
    pub signer: String,
    pub block_number: u64,
    pub transaction_hash: String,
}

#[async_trait]
pub(crate) trait BlockchainPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Verifier kind for signing keys this chain understands.
    fn verifier_type(&self) -> &str;

    /// Submit a batch pin. Must be idempotent on `idempotency_key`: a
    /// resubmission after a transient failure may not double-pin.
    async fn submit_batch_pin(
        &self,
        pin: &BatchPin,
        signing_key: &str,
        idempotency_key: &str,
    ) -> PluginResult<()>;

    async fn submit_network_action(
        &self,
        action: &str,
        signing_key: &str,
        idempotency_key: &str,
    ) -> PluginResult<()>;

    async fn operation_status(&self, idempotency_key: &str) -> PluginResult<OpPollStatus>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pinned_context_wire_roundtrip() {
        let entry = PinnedContext {
            context: HashType::new([7; 32]),
            nonce: 258,
        };
        let wire = entry.to_wire();
        assert_eq!(wire.len(), 80);
        assert!(wire.ends_with("0102"));
        assert_eq!(PinnedContext::from_wire(&wire).unwrap(), entry);
    }

    #[test]
    fn test_pinned_context_rejects_bad_length() {
        assert!(PinnedContext::from_wire("abcd").is_err());
    }
}
