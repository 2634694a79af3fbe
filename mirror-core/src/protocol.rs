//! Wire protocol for state updates.
//!
//! Every message is one JSON object:
//! ```text
//! {"id":"3f2a…","version":4,"delta":true,"body":{"b":2,"a":null}}
//! {"ping":true}
//! ```
//!
//! | field     | present when                                   |
//! |-----------|------------------------------------------------|
//! | `id`      | first update on a connection                   |
//! | `ping`    | keepalive; carries nothing else                |
//! | `delta`   | `body` is a merge patch on `version - 1`       |
//! | `version` | every non-ping update                          |
//! | `body`    | full document or patch; absent = state cleared |
//!
//! The body is carried as raw JSON so the server can share one encoded
//! snapshot between all connections.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// One message from server to client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Update {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ping: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delta: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Arc<RawValue>>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl Update {
    /// Keepalive message.
    pub fn ping() -> Self {
        Self {
            ping: true,
            ..Self::default()
        }
    }

    /// Full document at `version`.
    pub fn snapshot(version: u64, body: Option<Arc<RawValue>>) -> Self {
        Self {
            version,
            body,
            ..Self::default()
        }
    }

    /// Merge patch taking `version - 1` to `version`.
    pub fn delta(version: u64, patch: Arc<RawValue>) -> Self {
        Self {
            version,
            delta: true,
            body: Some(patch),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Body as JSON text, if any.
    pub fn body_str(&self) -> Option<&str> {
        self.body.as_deref().map(RawValue::get)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Resumption hint sent by a reconnecting client as query parameters
/// `id` and `v`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
}

impl ResumeHint {
    pub fn new(id: Option<String>, version: u64) -> Self {
        Self {
            id,
            v: Some(version.to_string()),
        }
    }

    /// The version a new connection to state `state_id` starts at.
    ///
    /// Returns the hinted version only when the hint names this state and
    /// carries a valid version, otherwise 0 (forcing a full snapshot).
    pub fn start_version(&self, state_id: &str) -> u64 {
        match (&self.id, &self.v) {
            (Some(id), Some(v)) if id == state_id => v.parse().unwrap_or(0),
            _ => 0,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
