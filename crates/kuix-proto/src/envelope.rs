//! The request envelope carried by every frame on the control channel.
//!
//! Three message kinds cover the whole call surface: one-way requests,
//! blocking requests correlated by a fresh UUID, and responses carrying the
//! same UUID back. The `rid` field is present exactly for the latter two.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message kind discriminator. The on-wire tags are literal strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    FireAndForget,
    Blocking,
    Response,
    /// Decodes any unrecognized tag; rejected at dispatch so one bad peer
    /// message never kills the connection.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub rtype: RequestType,
    pub endpoint: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<Uuid>,
}

impl Envelope {
    pub fn fire_and_forget(endpoint: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            rtype: RequestType::FireAndForget,
            endpoint: endpoint.into(),
            data,
            rid: None,
        }
    }

    pub fn blocking(endpoint: impl Into<String>, data: serde_json::Value, rid: Uuid) -> Self {
        Self {
            rtype: RequestType::Blocking,
            endpoint: endpoint.into(),
            data,
            rid: Some(rid),
        }
    }

    pub fn response(endpoint: impl Into<String>, data: serde_json::Value, rid: Uuid) -> Self {
        Self {
            rtype: RequestType::Response,
            endpoint: endpoint.into(),
            data,
            rid: Some(rid),
        }
    }
}
