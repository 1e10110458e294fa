//! Serde helpers for byte payloads.
//!
//! Definitions, mappings and bus envelopes are JSON documents. Raw byte
//! payloads (`Data` values, channel messages) are carried as standard base64
//! strings instead of JSON number arrays. For backwards compatibility the
//! deserializer also accepts a plain array of numbers.

use base64::Engine as _;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::Serializer;
use std::fmt;

/// Serialize bytes as a base64 string.
pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Deserialize bytes from a base64 string or an array of numbers.
pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a base64 string or an array of bytes")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            base64::engine::general_purpose::STANDARD
                .decode(v)
                .map_err(|e| E::custom(format!("invalid base64: {e}")))
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                out.push(byte);
            }
            Ok(out)
        }
    }

    d.deserialize_any(BytesVisitor)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Blob {
        #[serde(with = "crate::serde_compat")]
        bytes: Vec<u8>,
    }

    #[test]
    fn test_bytes_as_base64() {
        let blob = Blob {
            bytes: vec![0, 1, 2, 255],
        };
        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, r#"{"bytes":"AAEC/w=="}"#);
    }

    #[test]
    fn test_bytes_from_number_array() {
        let blob: Blob = serde_json::from_str(r#"{"bytes":[7,8,9]}"#).unwrap();
        assert_eq!(blob.bytes, vec![7, 8, 9]);
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let result: Result<Blob, _> = serde_json::from_str(r#"{"bytes":"%%%"}"#);
        assert!(result.is_err());
    }
}
