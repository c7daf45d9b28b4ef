use serde::{Deserialize, Serialize};

use crate::utilities::hash::{hash_of, HashType};
use crate::utilities::{generate_entity_id, EntityId};

/// Reference to an out-of-line binary payload. The node never stores blob
/// bytes itself; it addresses them by hash and asks the data-exchange layer
/// whether they are locally present.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BlobRef {
    pub hash: HashType,
    pub size: u64,
    /// Public download reference once uploaded to shared storage, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ref: Option<String>,
}

/// An immutable data item: either an inline JSON value or a blob reference,
/// never both.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Data {
    pub id: EntityId,
    pub namespace: String,
    pub hash: HashType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobRef>,
}

impl Data {
    pub(crate) fn inline(namespace: &str, value: serde_json::Value) -> anyhow::Result<Self> {
        let hash = hash_of(&value)?;
        Ok(Self {
            id: generate_entity_id(),
            namespace: namespace.to_string(),
            hash,
            value: Some(value),
            blob: None,
        })
    }

    pub(crate) fn blob(namespace: &str, blob: BlobRef) -> Self {
        Self {
            id: generate_entity_id(),
            namespace: namespace.to_string(),
            hash: blob.hash,
            value: None,
            blob: Some(blob),
        }
    }

    /// Value-or-blob is mutually exclusive; a row violating it is corrupt.
    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        match (&self.value, &self.blob) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => anyhow::bail!("Data {} has both value and blob", self.id),
            (None, None) => anyhow::bail!("Data {} has neither value nor blob", self.id),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_inline_hash_is_value_hash() {
        let value = serde_json::json!({"hello": "world"});
        let data = Data::inline("ns1", value.clone()).unwrap();
        assert_eq!(data.hash, hash_of(&value).unwrap());
        assert!(data.validate().is_ok());
    }

    #[test]
    fn test_blob_hash_is_blob_hash() {
        let blob = BlobRef {
            hash: HashType::new([3; 32]),
            size: 1024,
            public_ref: None,
        };
        let data = Data::blob("ns1", blob.clone());
        assert_eq!(data.hash, blob.hash);
        assert!(data.validate().is_ok());
    }

    #[test]
    fn test_value_and_blob_rejected() {
        let mut data = Data::inline("ns1", serde_json::json!(1)).unwrap();
        data.blob = Some(BlobRef {
            hash: HashType::new([3; 32]),
            size: 1,
            public_ref: None,
        });
        assert!(data.validate().is_err());
    }
}
