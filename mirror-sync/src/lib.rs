//! # mirror-sync — Live state sync over event streams and WebSockets
//!
//! Serves one versioned object to many clients and keeps client-side
//! mirrors in step with it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  write   ┌─────────────────┐  snapshot/delta  ┌────────────┐
//! │ SyncMap/Vec  │ ───────► │ VersionedState  │ ───────────────► │ Connection │ ─┐
//! │ (bound)      │  push()  │ (single-flight) │   per version    │ (per peer) │  │
//! └──────────────┘          └─────────────────┘                  └────────────┘  │
//!                                                                  SSE / WS      │
//!                                                                                ▼
//!                                   ┌───────────┐   replace    ┌────────────────────┐
//!                                   │  Mirror   │ ◄─────────── │ Client (reconnect, │
//!                                   │  (local)  │              │ merge, backoff)    │
//!                                   └───────────┘              └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`state`] — versioned state and the throttled push scheduler
//! - [`conn`] — per-connection delivery and keepalive
//! - [`transport`] — event-stream and WebSocket transports, negotiation
//! - [`server`] — axum endpoint and standalone server
//! - [`client`] — reconnecting client with resume

pub mod client;
pub mod conn;
pub mod server;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use client::{Backoff, Client, ClientConfig, ClientError, ConnectionState, SyncEvent};
pub use conn::Connection;
pub use server::{sync_router, ServerConfig, SyncServer};
pub use state::{StateConfig, StateError, StateStats, VersionedState};
pub use transport::{negotiate, NegotiateError, Transport, TransportError, TransportKind};
