//! HTTP endpoint serving one [`VersionedState`].
//!
//! ```text
//!  GET /sync?id=<state id>&v=<version>
//!     │
//!     ├── Accept: text/event-stream ──► SseTransport ──┐
//!     ├── Upgrade: websocket ─────────► WsTransport ───┼──► VersionedState::serve
//!     └── anything else ──► 400                        │
//!                                                      ▼
//!                                      ping, then snapshot/delta per version
//! ```

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use mirror_core::{ResumeHint, Source};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::state::VersionedState;
use crate::transport::{negotiate, SseTransport, TransportKind, WsTransport};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Route the sync endpoint is mounted on
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            path: "/sync".to_string(),
        }
    }
}

/// Build a router that serves `state` on `path`.
///
/// Merge it into a larger application router to share a listener.
pub fn sync_router<S: Source>(state: VersionedState<S>, path: &str) -> Router {
    Router::new()
        .route(path, get(sync_handler::<S>))
        .with_state(state)
}

async fn sync_handler<S: Source>(
    State(state): State<VersionedState<S>>,
    ws: Option<WebSocketUpgrade>,
    Query(hint): Query<ResumeHint>,
    headers: HeaderMap,
) -> Response {
    let kind = match negotiate(&headers) {
        Ok(kind) => kind,
        Err(e) => {
            log::warn!("rejected sync request: {e}");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    match (kind, ws) {
        (TransportKind::EventStream, _) => {
            let (transport, response) = SseTransport::connect();
            tokio::spawn(async move {
                if let Err(e) = state.serve(transport, &hint).await {
                    log::warn!("event stream connection failed: {e}");
                }
            });
            response
        }
        (TransportKind::WebSocket, Some(ws)) => ws.on_upgrade(move |socket| async move {
            if let Err(e) = state.serve(WsTransport::connect(socket), &hint).await {
                log::warn!("websocket connection failed: {e}");
            }
        }),
        (TransportKind::WebSocket, None) => {
            log::warn!("rejected sync request: websocket upgrade headers incomplete");
            (StatusCode::BAD_REQUEST, "invalid sync request").into_response()
        }
    }
}

/// The sync server.
pub struct SyncServer<S> {
    config: ServerConfig,
    state: VersionedState<S>,
}

impl<S: Source> SyncServer<S> {
    pub fn new(config: ServerConfig, state: VersionedState<S>) -> Self {
        Self { config, state }
    }

    /// Create with default configuration.
    pub fn with_defaults(state: VersionedState<S>) -> Self {
        Self::new(ServerConfig::default(), state)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> &VersionedState<S> {
        &self.state
    }

    pub fn router(&self) -> Router {
        sync_router(self.state.clone(), &self.config.path)
    }

    /// Bind and serve until the process exits.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}{}", self.config.bind_addr, self.config.path);
        axum::serve(listener, self.router()).await
    }

    /// Bind and serve until `shutdown` is cancelled.
    pub async fn run_until(&self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}{}", self.config.bind_addr, self.config.path);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled_owned().await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::Unlocked;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.path, "/sync");
    }

    #[tokio::test]
    async fn test_server_creation() {
        let state = VersionedState::with_defaults(Unlocked::new(serde_json::Map::new())).unwrap();
        let server = SyncServer::with_defaults(state);
        assert_eq!(server.state().version(), 1);
        assert_eq!(server.state().num_connections(), 0);
    }

    #[tokio::test]
    async fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            path: "/live".to_string(),
        };
        let state = VersionedState::with_defaults(Unlocked::new(serde_json::Map::new())).unwrap();
        let server = SyncServer::new(config, state);
        assert_eq!(server.config().path, "/live");
    }
}
