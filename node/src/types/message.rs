use serde::{Deserialize, Serialize};

use crate::utilities::encoding;
use crate::utilities::hash::{ContentHasher, HashType, Hasher};
use crate::utilities::time::now_millis;
use crate::utilities::{generate_entity_id, EntityId};

use super::pin::context_hash;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Broadcast,
    Private,
    TransferBroadcast,
    TransferPrivate,
    Definition,
}

impl MessageType {
    pub(crate) fn is_private(self) -> bool {
        matches!(self, MessageType::Private | MessageType::TransferPrivate)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            MessageType::Broadcast => "broadcast",
            MessageType::Private => "private",
            MessageType::TransferBroadcast => "transfer_broadcast",
            MessageType::TransferPrivate => "transfer_private",
            MessageType::Definition => "definition",
        }
    }

    pub(crate) fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "broadcast" => Ok(MessageType::Broadcast),
            "private" => Ok(MessageType::Private),
            "transfer_broadcast" => Ok(MessageType::TransferBroadcast),
            "transfer_private" => Ok(MessageType::TransferPrivate),
            "definition" => Ok(MessageType::Definition),
            other => anyhow::bail!("Unknown message type: {other}"),
        }
    }
}

/// Local delivery lifecycle of a message. Not part of the wire form.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Staged,
    Ready,
    Sent,
    Confirmed,
    Rejected,
}

impl MessageState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            MessageState::Staged => "staged",
            MessageState::Ready => "ready",
            MessageState::Sent => "sent",
            MessageState::Confirmed => "confirmed",
            MessageState::Rejected => "rejected",
        }
    }

    pub(crate) fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "staged" => Ok(MessageState::Staged),
            "ready" => Ok(MessageState::Ready),
            "sent" => Ok(MessageState::Sent),
            "confirmed" => Ok(MessageState::Confirmed),
            "rejected" => Ok(MessageState::Rejected),
            other => anyhow::bail!("Unknown message state: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MessageHeader {
    pub namespace: String,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<HashType>,
    pub topics: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub created: u64,
    /// Correlation id: the prior message of a chain this message extends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DataRef {
    pub id: EntityId,
    pub hash: HashType,
}

/// The immutable wire form of a message. Local lifecycle state travels
/// separately (see [`MessageRecord`]) so the hash is identical on every node.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Message {
    pub id: EntityId,
    pub header: MessageHeader,
    pub data: Vec<DataRef>,
    pub hash: HashType,
}

impl Message {
    pub(crate) fn new(header: MessageHeader, data: Vec<DataRef>) -> anyhow::Result<Self> {
        let mut msg = Self {
            id: generate_entity_id(),
            header,
            data,
            hash: HashType::new([0; 32]),
        };
        msg.hash = msg.compute_hash()?;
        Ok(msg)
    }

    /// hash(canonical(header) ++ data hashes), in data order.
    pub(crate) fn compute_hash(&self) -> anyhow::Result<HashType> {
        let mut hasher = Hasher::default();
        hasher.update(&encoding::canonical(&self.header)?);
        for data_ref in &self.data {
            hasher.update(data_ref.hash.hex().as_bytes());
        }
        Ok(hasher.finish().into())
    }

    pub(crate) fn verify_hash(&self) -> anyhow::Result<bool> {
        Ok(self.compute_hash()? == self.hash)
    }

    /// One ordering context per topic.
    pub(crate) fn contexts(&self) -> anyhow::Result<Vec<HashType>> {
        self.header
            .topics
            .iter()
            .map(|topic| {
                context_hash(
                    &self.header.namespace,
                    topic,
                    self.header.group.as_ref(),
                )
            })
            .collect()
    }
}

/// A message as stored locally: the wire form plus delivery lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub message: Message,
    pub state: MessageState,
    pub batch: Option<EntityId>,
}

impl MessageRecord {
    pub(crate) fn staged(message: Message) -> Self {
        Self {
            message,
            state: MessageState::Staged,
            batch: None,
        }
    }
}

pub(crate) fn new_header(
    namespace: &str,
    author: &str,
    message_type: MessageType,
    topics: Vec<String>,
) -> MessageHeader {
    MessageHeader {
        namespace: namespace.to_string(),
        author: author.to_string(),
        group: None,
        topics,
        tag: None,
        message_type,
        created: now_millis(),
        cid: None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn message(topics: Vec<&str>) -> Message {
        let header = new_header(
            "ns1",
            "did:org/alice",
            MessageType::Broadcast,
            topics.into_iter().map(String::from).collect(),
        );
        Message::new(header, vec![]).unwrap()
    }

    #[test]
    fn test_hash_covers_header() {
        let m1 = message(vec!["t1"]);
        let mut m2 = m1.clone();
        assert!(m2.verify_hash().unwrap());

        m2.header.topics = vec!["t2".to_string()];
        assert!(!m2.verify_hash().unwrap());
    }

    #[test]
    fn test_hash_covers_data_refs() {
        let mut m = message(vec!["t1"]);
        assert!(m.verify_hash().unwrap());

        m.data.push(DataRef {
            id: "d1".to_string(),
            hash: HashType::new([9; 32]),
        });
        assert!(!m.verify_hash().unwrap());
    }

    #[test]
    fn test_one_context_per_topic() {
        let m = message(vec!["t1", "t2"]);
        let contexts = m.contexts().unwrap();
        assert_eq!(contexts.len(), 2);
        assert_ne!(contexts[0], contexts[1]);
    }

    #[test]
    fn test_wire_roundtrip_preserves_hash() {
        let m = message(vec!["t1"]);
        let bytes = crate::utilities::encoding::canonical(&m).unwrap();
        let back: Message = crate::utilities::encoding::decode(&bytes).unwrap();
        assert_eq!(m, back);
        assert!(back.verify_hash().unwrap());
    }
}
