//! Canonical byte encoding for every on-chain object.
//!
//! The convention: serde_json over types whose struct fields serialize in
//! declaration order and whose maps are `BTreeMap` (lexicographic key
//! order). The encoding is therefore stable under round-trip and never
//! depends on hash-map iteration order. Every hash in the system is
//! computed over this encoding.

use crate::error::CodecError;
use serde::{de::DeserializeOwned, Serialize};

pub fn to_canonical<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|e| CodecError::Encoding(e.to_string()))
}

pub fn from_canonical<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|_| CodecError::Malformed)
}

/// Hex-string serde for binary fields (pubkeys, signatures, payloads) so
/// the canonical encoding stays readable and compact.
pub mod serde_hex {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        entries: BTreeMap<String, u64>,
    }

    #[test]
    fn round_trip() {
        let mut entries = BTreeMap::new();
        entries.insert("b".to_string(), 2);
        entries.insert("a".to_string(), 1);
        let sample = Sample {
            name: "x".into(),
            entries,
        };
        let bytes = to_canonical(&sample).unwrap();
        let back: Sample = from_canonical(&bytes).unwrap();
        assert_eq!(sample, back);
    }

    #[test]
    fn map_keys_sorted() {
        let mut entries = BTreeMap::new();
        entries.insert("z".to_string(), 1);
        entries.insert("a".to_string(), 2);
        let sample = Sample {
            name: "x".into(),
            entries,
        };
        let text = String::from_utf8(to_canonical(&sample).unwrap()).unwrap();
        assert!(text.find("\"a\"").unwrap() < text.find("\"z\"").unwrap());
    }
}
