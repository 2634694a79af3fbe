//! Sync client: keeps a local [`Mirror`] in step with a remote state.
//!
//! Provides:
//! - Connection lifecycle with capped exponential backoff
//! - Both wire styles (event stream, WebSocket)
//! - Resume by state id and version, so a reconnect can continue with a delta
//! - A cached document that deltas are merged into before the mirror is replaced
//!
//! A delta that does not follow the held version ends the attempt; the next
//! attempt starts from a full snapshot. A delta arriving with nothing cached
//! is taken as the whole document.

pub mod evtsrc;

use std::future::Future;
use std::mem;
use std::time::Duration;

use futures_util::StreamExt;
use mirror_core::merge::{self, Document, MergeError};
use mirror_core::{Mirror, OwnerError, ProtocolError, ResumeHint, Update};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::transport::TransportKind;
use evtsrc::EventDecoder;

pub const DEFAULT_MIN_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(10);
/// Comfortably above the server's default ping interval.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    Url(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("websocket failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("unexpected content type {0:?}")]
    ContentType(String),
    #[error("stream closed by server")]
    StreamClosed,
    #[error("nothing received for {0:?}")]
    IdleTimeout(Duration),
    #[error("bad message: {0}")]
    Decode(#[from] ProtocolError),
    #[error("bad patch: {0}")]
    Patch(#[from] MergeError),
    #[error("apply failed: {0}")]
    Apply(#[from] OwnerError),
    #[error("version gap: holding {have}, got delta for {got}")]
    VersionGap { have: u64, got: u64 },
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Sync endpoint, `http(s)://`. Rewritten to `ws(s)://` for WebSocket.
    pub url: String,
    pub transport: TransportKind,
    /// Reconnect after failures; when off the first failure is returned
    pub retry: bool,
    pub min_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Restart the backoff from the minimum after a connection that was
    /// established and later dropped
    pub reset_backoff_on_success: bool,
    /// Give up on a connection that delivers nothing (not even a ping)
    pub idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9090/sync".to_string(),
            transport: TransportKind::EventStream,
            retry: true,
            min_retry_delay: DEFAULT_MIN_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            reset_backoff_on_success: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Capped exponential backoff: `min`, `2·min`, `4·min`, … up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Zero bounds fall back to the defaults; `max` never drops below `min`.
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = if min.is_zero() { DEFAULT_MIN_RETRY_DELAY } else { min };
        let max = if max.is_zero() { DEFAULT_MAX_RETRY_DELAY } else { max }.max(min);
        Self { min, max, current: min }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// The mirror now reflects `version`
    Updated { version: u64 },
    /// A failed message or connection attempt
    Error(String),
}

#[derive(Debug, Default)]
struct Session {
    id: Option<String>,
    version: u64,
    state: ConnectionState,
    cache: Option<Document>,
}

/// The sync client.
pub struct Client<M> {
    config: ClientConfig,
    mirror: M,
    http: reqwest::Client,
    session: Mutex<Session>,
    active: Mutex<Option<CancellationToken>>,
    running: tokio::sync::Mutex<()>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl<M: Mirror> Client<M> {
    pub fn new(config: ClientConfig, mirror: M) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().build()?;
        let (event_tx, event_rx) = mpsc::channel(256);
        Ok(Self {
            config,
            mirror,
            http,
            session: Mutex::new(Session::default()),
            active: Mutex::new(None),
            running: tokio::sync::Mutex::new(()),
            event_tx,
            event_rx: Some(event_rx),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn mirror(&self) -> &M {
        &self.mirror
    }

    pub fn state(&self) -> ConnectionState {
        self.session.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Version the mirror reflects; 0 before the first update.
    pub fn version(&self) -> u64 {
        self.session.lock().version
    }

    /// Id of the remote state, once received.
    pub fn id(&self) -> Option<String> {
        self.session.lock().id.clone()
    }

    /// Run the sync loop until `cancel` fires.
    ///
    /// Returns `Ok(())` on cancellation. With `retry` off, the first failed
    /// attempt is returned as an error.
    pub async fn connect(&self, cancel: CancellationToken) -> Result<(), ClientError> {
        let _running = self.running.lock().await;
        *self.active.lock() = Some(cancel.clone());

        let mut backoff = Backoff::new(self.config.min_retry_delay, self.config.max_retry_delay);
        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            self.set_state(ConnectionState::Connecting);

            let mut established = false;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                outcome = self.connect_once(&mut established) => outcome,
            };
            self.mark_disconnected();
            if cancel.is_cancelled() {
                break Ok(());
            }

            let err = outcome.err().unwrap_or(ClientError::StreamClosed);
            log::warn!("sync connection to {} ended: {err}", self.config.url);
            self.emit(SyncEvent::Error(err.to_string()));
            if !self.config.retry {
                break Err(err);
            }

            if established && self.config.reset_backoff_on_success {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            self.set_state(ConnectionState::Reconnecting);
            log::info!("reconnecting to {} in {delay:?}", self.config.url);
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        *self.active.lock() = None;
        self.set_state(ConnectionState::Disconnected);
        result
    }

    /// Cancel a running [`connect`](Self::connect) and wait for it to return.
    pub async fn disconnect(&self) {
        let active = self.active.lock().clone();
        if let Some(token) = active {
            token.cancel();
        }
        let _idle = self.running.lock().await;
    }

    async fn connect_once(&self, established: &mut bool) -> Result<(), ClientError> {
        let url = self.request_url()?;
        match self.config.transport {
            TransportKind::EventStream => self.run_event_stream(url, established).await,
            TransportKind::WebSocket => self.run_websocket(url, established).await,
        }
    }

    /// The endpoint plus `id` and `v` once something has been received.
    fn request_url(&self) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.config.url).map_err(|e| ClientError::Url(e.to_string()))?;
        let session = self.session.lock();
        if session.version > 0 {
            let hint = ResumeHint::new(session.id.clone(), session.version);
            let mut pairs = url.query_pairs_mut();
            if let Some(id) = &hint.id {
                pairs.append_pair("id", id);
            }
            if let Some(v) = &hint.v {
                pairs.append_pair("v", v);
            }
        }
        Ok(url)
    }

    async fn run_event_stream(&self, url: Url, established: &mut bool) -> Result<(), ClientError> {
        let response = self
            .http
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ClientError::Status(status.as_u16()));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("text/event-stream") {
            return Err(ClientError::ContentType(content_type));
        }

        self.mark_connected();
        *established = true;

        let mut body = response.bytes_stream();
        let mut decoder = EventDecoder::new();
        loop {
            let chunk = match self.within_idle(body.next()).await? {
                None => return Err(ClientError::StreamClosed),
                Some(chunk) => chunk?,
            };
            for event in decoder.feed(&chunk) {
                self.on_message(&event.data)?;
            }
        }
    }

    async fn run_websocket(&self, mut url: Url, established: &mut bool) -> Result<(), ClientError> {
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| ClientError::Url(format!("cannot switch {url} to {scheme}")))?;

        let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        self.mark_connected();
        *established = true;

        loop {
            let message = match self.within_idle(socket.next()).await? {
                None => return Err(ClientError::StreamClosed),
                Some(message) => message?,
            };
            match message {
                Message::Text(text) => self.on_message(text.as_str())?,
                Message::Close(_) => return Err(ClientError::StreamClosed),
                _ => {}
            }
        }
    }

    async fn within_idle<F: Future>(&self, next: F) -> Result<F::Output, ClientError> {
        let idle = self.config.idle_timeout;
        tokio::time::timeout(idle, next)
            .await
            .map_err(|_| ClientError::IdleTimeout(idle))
    }

    /// Handle one message. Only a version gap ends the connection; any
    /// other failure is reported and the message skipped.
    fn on_message(&self, text: &str) -> Result<(), ClientError> {
        match self.apply_message(text) {
            Err(e @ ClientError::VersionGap { .. }) => Err(e),
            Err(e) => {
                log::warn!("skipping update: {e}");
                self.emit(SyncEvent::Error(e.to_string()));
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn apply_message(&self, text: &str) -> Result<(), ClientError> {
        let update = Update::decode(text)?;
        if update.ping {
            log::trace!("ping from {}", self.config.url);
            return Ok(());
        }

        let document = {
            let mut session = self.session.lock();
            if let Some(id) = update.id.clone() {
                session.id = Some(id);
            }

            match update.body_str() {
                None => {
                    session.cache = None;
                    session.version = update.version;
                    None
                }
                Some(body) if update.delta && session.cache.is_some() => {
                    if session.version.checked_add(1) != Some(update.version) {
                        let have = session.version;
                        session.cache = None;
                        session.version = 0;
                        return Err(ClientError::VersionGap {
                            have,
                            got: update.version,
                        });
                    }
                    let patch = merge::parse_document(body)?;
                    let cache = session.cache.get_or_insert_with(Document::new);
                    merge::apply(cache, &patch);
                    let merged = serde_json::to_string(cache).map_err(OwnerError::Serialize)?;
                    session.version = update.version;
                    Some(merged)
                }
                // A snapshot, or a delta with nothing cached to patch.
                Some(body) => {
                    session.cache = merge::parse_document(body).ok();
                    session.version = update.version;
                    Some(body.to_string())
                }
            }
        };

        match document {
            Some(document) => self.mirror.replace(&document)?,
            None => self.mirror.reset(),
        }
        log::debug!("mirror at version {}", update.version);
        self.emit(SyncEvent::Updated {
            version: update.version,
        });
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        self.session.lock().state = state;
    }

    fn mark_connected(&self) {
        self.set_state(ConnectionState::Connected);
        log::info!("connected to {} over {}", self.config.url, self.config.transport);
        self.emit(SyncEvent::Connected);
    }

    fn mark_disconnected(&self) {
        let was = mem::take(&mut self.session.lock().state);
        if was == ConnectionState::Connected {
            self.emit(SyncEvent::Disconnected);
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::debug!("dropping client event: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::{BindError, Bindable, Binder, SyncMap};
    use parking_lot::RwLock;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Doc {
        #[serde(default)]
        a: Option<i64>,
        #[serde(default)]
        b: Option<i64>,
        #[serde(default)]
        tags: SyncMap<String, bool>,
    }

    impl Bindable for Doc {
        fn bind_fields(&self, binder: &mut Binder<'_>) -> Result<(), BindError> {
            binder.container(&self.tags);
            Ok(())
        }
    }

    fn client() -> Client<Arc<RwLock<Doc>>> {
        Client::new(ClientConfig::default(), Arc::new(RwLock::new(Doc::default()))).unwrap()
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_zero_bounds_use_defaults() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(backoff.next_delay(), DEFAULT_MIN_RETRY_DELAY);

        let mut inverted = Backoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(inverted.next_delay(), Duration::from_secs(2));
        assert_eq!(inverted.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_snapshot_then_deltas() {
        let mut client = client();
        let mut events = client.take_event_rx().unwrap();

        client.on_message(r#"{"ping":true}"#).unwrap();
        client.on_message(r#"{"id":"s1","version":1,"body":{"a":1}}"#).unwrap();
        client.on_message(r#"{"delta":true,"version":2,"body":{"b":2}}"#).unwrap();
        {
            let doc = client.mirror().read();
            assert_eq!((doc.a, doc.b), (Some(1), Some(2)));
        }

        client.on_message(r#"{"delta":true,"version":3,"body":{"a":null}}"#).unwrap();
        {
            let doc = client.mirror().read();
            assert_eq!((doc.a, doc.b), (None, Some(2)));
        }
        assert_eq!(client.version(), 3);
        assert_eq!(client.id().as_deref(), Some("s1"));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                SyncEvent::Updated { version: 1 },
                SyncEvent::Updated { version: 2 },
                SyncEvent::Updated { version: 3 },
            ]
        );
    }

    #[test]
    fn test_delta_patches_nested_container() {
        let client = client();
        client
            .on_message(r#"{"id":"s1","version":1,"body":{"tags":{"x":true,"y":true}}}"#)
            .unwrap();
        client
            .on_message(r#"{"delta":true,"version":2,"body":{"tags":{"x":null}}}"#)
            .unwrap();
        let tags = client.mirror().read().tags.clone();
        assert_eq!(tags.keys(), vec!["y".to_string()]);
    }

    #[test]
    fn test_version_gap_is_fatal() {
        let client = client();
        client.on_message(r#"{"id":"s1","version":1,"body":{"a":1}}"#).unwrap();
        let err = client
            .on_message(r#"{"delta":true,"version":3,"body":{"b":2}}"#)
            .unwrap_err();
        assert!(matches!(err, ClientError::VersionGap { have: 1, got: 3 }));
        assert_eq!(client.version(), 0);
        // The id survives, but with version 0 the next request is a fresh one.
        assert_eq!(client.id().as_deref(), Some("s1"));
        assert_eq!(client.request_url().unwrap().query(), None);
    }

    #[test]
    fn test_delta_without_cache_replaces_document() {
        let client = client();
        client
            .on_message(r#"{"delta":true,"version":1,"body":{"a":1}}"#)
            .unwrap();
        assert_eq!(client.mirror().read().a, Some(1));
        assert_eq!(client.version(), 1);

        // The replacement is cached, so the next delta patches it.
        client
            .on_message(r#"{"delta":true,"version":2,"body":{"b":2}}"#)
            .unwrap();
        let doc = client.mirror().read();
        assert_eq!((doc.a, doc.b), (Some(1), Some(2)));
    }

    #[test]
    fn test_version_gap_at_max_version() {
        let client = client();
        client
            .on_message(&format!(r#"{{"id":"s1","version":{},"body":{{"a":1}}}}"#, u64::MAX))
            .unwrap();
        let err = client
            .on_message(r#"{"delta":true,"version":1,"body":{"b":2}}"#)
            .unwrap_err();
        assert!(matches!(err, ClientError::VersionGap { got: 1, .. }));
    }

    #[test]
    fn test_bad_message_is_skipped() {
        let mut client = client();
        let mut events = client.take_event_rx().unwrap();
        client.on_message("not json").unwrap();
        client.on_message(r#"{"version":1,"body":{"a":"text"}}"#).unwrap();
        assert!(matches!(events.try_recv(), Ok(SyncEvent::Error(_))));
        assert!(matches!(events.try_recv(), Ok(SyncEvent::Error(_))));
        assert_eq!(client.mirror().read().a, None);
    }

    #[test]
    fn test_empty_body_resets_mirror() {
        let client = client();
        client.on_message(r#"{"id":"s1","version":1,"body":{"a":1}}"#).unwrap();
        client.on_message(r#"{"version":2}"#).unwrap();
        assert_eq!(client.mirror().read().a, None);
        assert_eq!(client.version(), 2);
        // Nothing cached, so a delta now is the whole document.
        client
            .on_message(r#"{"delta":true,"version":3,"body":{"a":1}}"#)
            .unwrap();
        assert_eq!(client.mirror().read().a, Some(1));
    }

    #[test]
    fn test_request_url_carries_resume_hint() {
        let client = client();
        assert_eq!(client.request_url().unwrap().query(), None);
        client.on_message(r#"{"id":"abc","version":7,"body":{}}"#).unwrap();
        assert_eq!(client.request_url().unwrap().query(), Some("id=abc&v=7"));
    }

    #[tokio::test]
    async fn test_retry_off_returns_first_failure() {
        let config = ClientConfig {
            url: "not a url".to_string(),
            retry: false,
            ..ClientConfig::default()
        };
        let client = Client::new(config, Arc::new(RwLock::new(Doc::default()))).unwrap();
        let result = client.connect(CancellationToken::new()).await;
        assert!(matches!(result, Err(ClientError::Url(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_stops_retry_loop() {
        let config = ClientConfig {
            url: "http://127.0.0.1:1/sync".to_string(),
            min_retry_delay: Duration::from_millis(20),
            ..ClientConfig::default()
        };
        let client = Arc::new(Client::new(config, Arc::new(RwLock::new(Doc::default()))).unwrap());
        let runner = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.connect(CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.disconnect().await;
        assert!(runner.await.unwrap().is_ok());
        assert!(!client.is_connected());
    }
}
