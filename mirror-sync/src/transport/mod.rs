//! Server-side transports.
//!
//! A transport turns [`Update`]s into wire frames: one text frame per update
//! over WebSocket, one `data:` event per update over an event stream.
//! [`negotiate`] picks the transport from the request headers.

mod sse;
mod ws;

pub use sse::SseTransport;
pub use ws::WsTransport;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::{ACCEPT, UPGRADE};
use axum::http::HeaderMap;
use mirror_core::{ProtocolError, Update};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport closed")]
    Closed,
    #[error("write failed: {0}")]
    Io(String),
    #[error("encode failed: {0}")]
    Encode(#[from] ProtocolError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiateError {
    #[error("invalid sync request")]
    InvalidRequest,
}

/// Wire style of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    EventStream,
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::EventStream => write!(f, "event-stream"),
            TransportKind::WebSocket => write!(f, "websocket"),
        }
    }
}

/// One open server-side connection.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Write one update, failing if it is not flushed within `timeout`.
    async fn send(&self, update: &Update, timeout: Duration) -> Result<(), TransportError>;

    /// Resolve once the peer has gone away.
    async fn wait(&self);

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Pick a transport: an `Accept` that names `text/event-stream` wins, then
/// an `Upgrade: websocket` (any case).
pub fn negotiate(headers: &HeaderMap) -> Result<TransportKind, NegotiateError> {
    let accepts_events = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains("text/event-stream"));
    if accepts_events {
        return Ok(TransportKind::EventStream);
    }

    let upgrade = headers.get(UPGRADE).and_then(|value| value.to_str().ok());
    match upgrade {
        Some(value) if value.eq_ignore_ascii_case("websocket") => Ok(TransportKind::WebSocket),
        _ => Err(NegotiateError::InvalidRequest),
    }
}
