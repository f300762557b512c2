//! Payload codec.
//!
//! Payloads travel as JSON text inside the envelopes. Everything that turns a
//! typed value into wire text, or back, goes through these functions so codec
//! failures always surface as [`CourierError::Serialization`] or
//! [`CourierError::Deserialization`] tagged with the logical type.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CourierError, Result};

/// Encode a value as payload text.
pub fn encode<T: Serialize + ?Sized>(message_type: &str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|source| CourierError::Serialization {
        message_type: message_type.to_string(),
        source,
    })
}

/// Decode payload text into the concrete type registered for `message_type`.
pub fn decode<T: DeserializeOwned>(message_type: &str, payload: &str) -> Result<T> {
    serde_json::from_str(payload).map_err(|source| CourierError::Deserialization {
        message_type: message_type.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Reserve {
        sku: String,
        quantity: u32,
    }

    #[test]
    fn test_decode_mismatch_names_type() {
        let err = decode::<Reserve>("Reserve", r#"{"sku":"A-1"}"#).unwrap_err();
        match err {
            CourierError::Deserialization { message_type, .. } => {
                assert_eq!(message_type, "Reserve")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_encode_then_decode() {
        let text = encode(
            "Reserve",
            &Reserve {
                sku: "A-1".into(),
                quantity: 2,
            },
        )
        .unwrap();
        let back: Reserve = decode("Reserve", &text).unwrap();
        assert_eq!(back.quantity, 2);
    }
}
