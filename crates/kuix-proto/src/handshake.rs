//! One-shot authentication exchange, performed before framing starts.
//!
//! The connecting side writes a plain JSON document (no EOT sentinel, at
//! most [`MAX_HANDSHAKE_BYTES`]): `{"identifier": ..., "key": ...}`. The
//! accepting side answers `{"status": "valid"}` and registers the
//! identifier, or `{"status": "invalid"}` and closes.

use serde::{Deserialize, Serialize};

/// Upper bound on the handshake payload, read in a single recv.
pub const MAX_HANDSHAKE_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub identifier: String,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub status: HandshakeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeStatus {
    Valid,
    Invalid,
}

impl HandshakeReply {
    pub fn valid() -> Self {
        Self {
            status: HandshakeStatus::Valid,
        }
    }

    pub fn invalid() -> Self {
        Self {
            status: HandshakeStatus::Invalid,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == HandshakeStatus::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_wire_shape() {
        let req = HandshakeRequest {
            identifier: "C1".into(),
            key: "k".into(),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value, serde_json::json!({"identifier": "C1", "key": "k"}));
    }

    #[test]
    fn reply_wire_shape() {
        assert_eq!(
            serde_json::to_value(HandshakeReply::valid()).unwrap(),
            serde_json::json!({"status": "valid"})
        );
        assert_eq!(
            serde_json::to_value(HandshakeReply::invalid()).unwrap(),
            serde_json::json!({"status": "invalid"})
        );
    }

    #[test]
    fn reply_roundtrip() {
        let back: HandshakeReply = serde_json::from_str(r#"{"status":"valid"}"#).unwrap();
        assert!(back.is_valid());
    }
}
