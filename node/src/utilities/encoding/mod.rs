use serde::Serialize;

/// Canonical wire encoding: UTF-8 JSON, keys sorted ascending, no whitespace,
/// integers as bare numbers, binary fields as lower-case hex.
///
/// serde_json's default `Map` is backed by a `BTreeMap`, so serializing through
/// `Value` yields sorted keys without extra bookkeeping. Binary fields produce
/// their hex form from their own `Serialize` impls.
pub(crate) fn canonical<M: Serialize>(message: &M) -> anyhow::Result<Vec<u8>> {
    let value = serde_json::to_value(message)?;
    serde_json::to_vec(&value).map_err(|e| anyhow::anyhow!(e))
}

pub(crate) fn decode<M: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> anyhow::Result<M> {
    serde_json::from_slice(bytes).map_err(|e| anyhow::anyhow!(e))
}

pub(crate) trait Encode {
    fn encode(&self) -> anyhow::Result<Vec<u8>>;
}

pub(crate) trait Decode {
    fn decode(bytes: &[u8]) -> anyhow::Result<Self>
    where
        Self: Sized;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_canonical_sorts_keys() {
        #[derive(serde::Serialize)]
        struct Unordered {
            zebra: u64,
            apple: &'static str,
        }

        let bytes = canonical(&Unordered {
            zebra: 7,
            apple: "a",
        })
        .unwrap();
        assert_eq!(bytes, br#"{"apple":"a","zebra":7}"#.to_vec());
    }

    #[test]
    fn test_canonical_no_whitespace() {
        let value = serde_json::json!({"a": [1, 2, 3], "b": {"c": true}});
        let bytes = canonical(&value).unwrap();
        assert!(!bytes.contains(&b' '));
    }

    #[test]
    fn test_roundtrip() {
        let value = serde_json::json!({"x": 1, "y": "two", "z": [false]});
        let bytes = canonical(&value).unwrap();
        let back: serde_json::Value = decode(&bytes).unwrap();
        assert_eq!(value, back);
    }
}
