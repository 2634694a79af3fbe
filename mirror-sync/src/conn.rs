//! One client connection to a [`VersionedState`](crate::VersionedState).
//!
//! Each connection tracks the last version it delivered. A push compares
//! that against the published version and sends either the latest delta
//! (when the connection is exactly one version behind and the delta is the
//! smaller payload) or the full snapshot. Pushes are single-flight per
//! connection, and every write, pings included, goes through one send lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use mirror_core::Update;
use tokio_util::sync::CancellationToken;

use crate::state::{Published, StateConfig};
use crate::transport::{Transport, TransportError, TransportKind};

pub struct Connection {
    id: u64,
    transport: Box<dyn Transport>,
    published: Arc<Published>,
    write_timeout: Duration,
    ping_interval: Duration,
    connected: AtomicBool,
    connected_at: OnceLock<Instant>,
    id_sent: AtomicBool,
    pushing: AtomicBool,
    queued: AtomicBool,
    sending: tokio::sync::Mutex<()>,
    version: AtomicU64,
    closed: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        transport: Box<dyn Transport>,
        published: Arc<Published>,
        config: &StateConfig,
        version: u64,
    ) -> Self {
        Self {
            id,
            transport,
            published,
            write_timeout: config.write_timeout,
            ping_interval: config.ping_interval,
            connected: AtomicBool::new(false),
            connected_at: OnceLock::new(),
            id_sent: AtomicBool::new(false),
            pushing: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            sending: tokio::sync::Mutex::new(()),
            version: AtomicU64::new(version),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at.get().copied()
    }

    /// Last version delivered to this connection.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Send the initial ping and start the keepalive loop.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        if let Err(e) = self.send(&Update::ping()).await {
            self.close().await;
            return Err(e);
        }
        let _ = self.connected_at.set(Instant::now());
        self.connected.store(true, Ordering::Release);
        log::info!("connection {} established over {}", self.id, self.transport.kind());

        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.keepalive().await });
        Ok(())
    }

    async fn keepalive(&self) {
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                _ = self.transport.wait() => {
                    log::debug!("connection {}: peer went away", self.id);
                    break;
                }
                _ = tokio::time::sleep(self.ping_interval) => {
                    if let Err(e) = self.send(&Update::ping()).await {
                        log::warn!("connection {}: ping failed: {e}", self.id);
                        break;
                    }
                    log::trace!("connection {}: ping", self.id);
                }
            }
        }
        self.close().await;
    }

    /// Bring the connection up to the published version.
    ///
    /// Calls made while a push is running collapse into one more round.
    pub async fn push(&self) {
        if !self.begin_push() {
            self.queued.store(true, Ordering::Release);
            return;
        }
        loop {
            self.push_latest().await;
            self.pushing.store(false, Ordering::Release);
            if !self.queued.swap(false, Ordering::AcqRel) || !self.begin_push() {
                break;
            }
        }
    }

    fn begin_push(&self) -> bool {
        self.pushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn push_latest(&self) {
        let sending = self.sending.lock().await;

        let Some(mut update) = self.published.update_for(self.version()) else {
            return;
        };
        if !self.id_sent.swap(true, Ordering::AcqRel) {
            update.id = Some(self.published.id().to_string());
        }

        match self.send_locked(&update).await {
            Ok(()) => log::debug!(
                "connection {}: sent version {}{}",
                self.id,
                update.version,
                if update.delta { " (delta)" } else { "" }
            ),
            Err(e) => {
                drop(sending);
                log::warn!("connection {}: push failed: {e}", self.id);
                self.close().await;
            }
        }
    }

    async fn send(&self, update: &Update) -> Result<(), TransportError> {
        let _sending = self.sending.lock().await;
        self.send_locked(update).await
    }

    async fn send_locked(&self, update: &Update) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.transport.send(update, self.write_timeout).await?;
        // Pings carry no version.
        if !update.ping {
            self.version.store(update.version, Ordering::Release);
        }
        Ok(())
    }

    /// Resolve once the connection has closed.
    pub async fn wait(&self) {
        self.closed.cancelled().await
    }

    pub async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.closed.cancel();
        self.transport.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.transport.kind())
            .field("version", &self.version())
            .field("connected", &self.is_connected())
            .finish()
    }
}
