use serde::{Deserialize, Serialize};

use crate::utilities::hash::{hash_of, HashType};
use crate::utilities::time::now_millis;
use crate::utilities::EntityId;

/// Ordering context: hash of (namespace, topic, group?). Every pin belongs to
/// exactly one context; per (context, signer) the nonce is a strictly
/// monotonic counter assigned at batch seal.
pub(crate) fn context_hash(
    namespace: &str,
    topic: &str,
    group: Option<&HashType>,
) -> anyhow::Result<HashType> {
    #[derive(Serialize)]
    struct Context<'a> {
        namespace: &'a str,
        topic: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        group: Option<&'a HashType>,
    }
    hash_of(&Context {
        namespace,
        topic,
        group,
    })
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PinState {
    /// Created locally at seal, or received from the ledger; not yet consumed.
    Waiting,
    /// Consumed by delivery; never revisited.
    Dispatched,
    /// Failed an integrity check; skipped to preserve liveness.
    Quarantined,
}

impl PinState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            PinState::Waiting => "waiting",
            PinState::Dispatched => "dispatched",
            PinState::Quarantined => "quarantined",
        }
    }

    pub(crate) fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "waiting" => Ok(PinState::Waiting),
            "dispatched" => Ok(PinState::Dispatched),
            "quarantined" => Ok(PinState::Quarantined),
            other => anyhow::bail!("Unknown pin state: {other}"),
        }
    }
}

/// An on-chain ordering token for one (message, topic) pair of a batch.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Pin {
    pub namespace: String,
    pub batch: EntityId,
    pub context: HashType,
    pub signer: String,
    pub nonce: u64,
    /// Position within the batch's flattened (message, topic) pin list.
    pub batch_index: u64,
    /// Local observation order of the ledger event that carried this pin.
    /// Absent until the pin has been seen on-chain.
    pub sequence: Option<i64>,
    /// Shared-storage download reference carried by the pin, for fetching the
    /// payload when it has not arrived yet. Absent for private batches.
    pub payload_ref: Option<String>,
    /// Batch hash asserted on-chain; a payload that does not match it is an
    /// integrity violation. Absent on locally-created pins.
    pub batch_hash: Option<HashType>,
    pub state: PinState,
    pub created: u64,
}

impl Pin {
    pub(crate) fn new(
        namespace: &str,
        batch: &EntityId,
        context: HashType,
        signer: &str,
        nonce: u64,
        batch_index: u64,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            batch: batch.clone(),
            context,
            signer: signer.to_string(),
            nonce,
            batch_index,
            sequence: None,
            payload_ref: None,
            batch_hash: None,
            state: PinState::Waiting,
            created: now_millis(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_context_hash_discriminates() {
        let c1 = context_hash("ns1", "t1", None).unwrap();
        let c2 = context_hash("ns1", "t2", None).unwrap();
        let c3 = context_hash("ns2", "t1", None).unwrap();
        assert_ne!(c1, c2);
        assert_ne!(c1, c3);
    }

    #[test]
    fn test_context_hash_group_scoped() {
        let group = HashType::new([5; 32]);
        let public = context_hash("ns1", "t1", None).unwrap();
        let private = context_hash("ns1", "t1", Some(&group)).unwrap();
        assert_ne!(public, private);
    }

    #[test]
    fn test_context_hash_deterministic() {
        let a = context_hash("ns1", "t1", None).unwrap();
        let b = context_hash("ns1", "t1", None).unwrap();
        assert_eq!(a, b);
    }
}
