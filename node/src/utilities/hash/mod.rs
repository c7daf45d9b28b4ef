use std::fmt::{Debug, Display};

use blake2::{Blake2b, Digest};
use digest::consts::U32;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utilities::encoding;

pub(crate) type Hasher = Blake2bHasher;

/// 256-bit content hash. Serializes as lower-case hex so it can appear
/// directly inside canonically-encoded payloads; displays as base58.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashType([u8; 32]);

impl HashType {
    pub fn new(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    pub(crate) fn base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    pub(crate) fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub(crate) fn from_hex(s: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Hash must be 32 bytes"))?;
        Ok(Self(arr))
    }
}

impl Debug for HashType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.base58())
    }
}

impl Display for HashType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base58())
    }
}

impl From<[u8; 32]> for HashType {
    fn from(hash: [u8; 32]) -> Self {
        Self(hash)
    }
}

impl Serialize for HashType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for HashType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        HashType::from_hex(&s).map_err(DeError::custom)
    }
}

/// A trait for hashing data.
pub(crate) trait ContentHasher: Default {
    /// Hashes the given data in one shot.
    fn digest(data: &[u8]) -> [u8; 32];

    /// Updates the hasher with the given data.
    fn update(&mut self, bytes: &[u8]);

    /// Finalizes the hasher and returns the hash.
    fn finish(&mut self) -> [u8; 32];
}

#[derive(Default)]
pub struct Blake2bHasher {
    hasher: Blake2b<U32>,
}

impl ContentHasher for Blake2bHasher {
    fn digest(data: &[u8]) -> [u8; 32] {
        let mut dest = [0; 32];
        type Blake2b256 = Blake2b<U32>;
        dest.copy_from_slice(Blake2b256::digest(data).as_slice());
        dest
    }

    fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    fn finish(&mut self) -> [u8; 32] {
        self.hasher.finalize_reset().into()
    }
}

/// Hash of the canonical encoding of any serializable value.
pub(crate) fn hash_of<M: Serialize>(value: &M) -> anyhow::Result<HashType> {
    let bytes = encoding::canonical(value)?;
    Ok(HashType::new(Hasher::digest(&bytes)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hash = HashType::new([7; 32]);
        let back = HashType::from_hex(&hash.hex()).unwrap();
        assert_eq!(hash, back);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = HashType::new([0xab; 32]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: HashType = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, back);
    }

    #[test]
    fn test_hash_of_stable_over_roundtrip() {
        let value = serde_json::json!({"b": 1, "a": [true, null]});
        let first = hash_of(&value).unwrap();
        let bytes = crate::utilities::encoding::canonical(&value).unwrap();
        let back: serde_json::Value = crate::utilities::encoding::decode(&bytes).unwrap();
        assert_eq!(first, hash_of(&back).unwrap());
    }
}
