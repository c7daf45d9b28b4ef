use serde::{Deserialize, Serialize};

use crate::utilities::encoding::{self, Decode, Encode};
use crate::utilities::hash::{hash_of, HashType};
use crate::utilities::time::now_millis;
use crate::utilities::{generate_entity_id, EntityId};

use super::data::Data;
use super::message::Message;
use super::transaction::TransactionType;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    Broadcast,
    Private,
}

impl BatchType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            BatchType::Broadcast => "broadcast",
            BatchType::Private => "private",
        }
    }

    pub(crate) fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "broadcast" => Ok(BatchType::Broadcast),
            "private" => Ok(BatchType::Private),
            other => anyhow::bail!("Unknown batch type: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TxRef {
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub id: EntityId,
}

/// The shipped unit: messages in submission order plus every data row they
/// reference. Its canonical encoding is what travels over shared storage and
/// data exchange, and what the batch hash commits to.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BatchPayload {
    pub messages: Vec<Message>,
    pub data: Vec<Data>,
}

impl BatchPayload {
    pub(crate) fn hash(&self) -> anyhow::Result<HashType> {
        hash_of(self)
    }

    pub(crate) fn size_bytes(&self) -> anyhow::Result<usize> {
        Ok(encoding::canonical(self)?.len())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Batch {
    pub id: EntityId,
    pub namespace: String,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<HashType>,
    #[serde(rename = "type")]
    pub batch_type: BatchType,
    pub payload: BatchPayload,
    pub hash: HashType,
    pub created: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<TxRef>,
}

impl Batch {
    pub(crate) fn open(
        namespace: &str,
        author: &str,
        group: Option<HashType>,
        batch_type: BatchType,
    ) -> Self {
        Self {
            id: generate_entity_id(),
            namespace: namespace.to_string(),
            author: author.to_string(),
            group,
            batch_type,
            payload: BatchPayload {
                messages: Vec::new(),
                data: Vec::new(),
            },
            hash: HashType::new([0; 32]),
            created: now_millis(),
            tx: None,
        }
    }

    pub(crate) fn recompute_hash(&mut self) -> anyhow::Result<()> {
        self.hash = self.payload.hash()?;
        Ok(())
    }

    pub(crate) fn verify_hash(&self) -> anyhow::Result<bool> {
        Ok(self.payload.hash()? == self.hash)
    }
}

impl Encode for BatchPayload {
    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        encoding::canonical(self)
    }
}

impl Decode for BatchPayload {
    fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        encoding::decode(bytes)
    }
}

/// A batch as stored locally; `sealed` flips exactly once and nothing about
/// the batch may change afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecord {
    pub batch: Batch,
    pub sealed: bool,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::message::{new_header, MessageType};

    fn batch_with_message() -> Batch {
        let mut batch = Batch::open("ns1", "did:org/alice", None, BatchType::Broadcast);
        let header = new_header("ns1", "did:org/alice", MessageType::Broadcast, vec!["t1".into()]);
        let message = Message::new(header, vec![]).unwrap();
        batch.payload.messages.push(message);
        batch.recompute_hash().unwrap();
        batch
    }

    #[test]
    fn test_hash_commits_to_payload() {
        let mut batch = batch_with_message();
        assert!(batch.verify_hash().unwrap());

        batch.payload.messages.clear();
        assert!(!batch.verify_hash().unwrap());
    }

    #[test]
    fn test_payload_wire_roundtrip() {
        let batch = batch_with_message();
        let bytes = batch.payload.encode().unwrap();
        let back = BatchPayload::decode(&bytes).unwrap();
        assert_eq!(batch.payload, back);
        assert_eq!(batch.payload.hash().unwrap(), back.hash().unwrap());
    }

    #[test]
    fn test_tx_not_part_of_hash() {
        let mut batch = batch_with_message();
        batch.tx = Some(TxRef {
            tx_type: TransactionType::BatchPin,
            id: "tx-1".to_string(),
        });
        assert!(batch.verify_hash().unwrap());
    }
}
