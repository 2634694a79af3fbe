//! Versioned state and the throttled push scheduler.
//!
//! ```text
//!  push() ──► pushing? ── yes ──► queued = true
//!               │ no
//!               ▼
//!   snapshot ─► diff ─► version++ ─► Connection::push (each stale conn)
//!               │
//!        sleep out the throttle ─► queued? ── yes ──► push()
//! ```
//!
//! Only one snapshot/diff runs at a time. Any number of `push()` calls
//! made during a cycle collapse into a single follow-up cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mirror_core::merge::{MergeError, MergePatcher};
use mirror_core::{BindError, OwnerError, Pusher, ResumeHint, Source, Update};
use parking_lot::{Mutex, RwLock};
use serde_json::value::RawValue;
use thiserror::Error;
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::conn::Connection;
use crate::transport::{Transport, TransportError};

/// Smallest accepted throttle; lower values fall back to [`DEFAULT_THROTTLE`].
pub const MIN_THROTTLE: Duration = Duration::from_millis(15);
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(200);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Browsers drop idle event streams after about 30s.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

/// State configuration.
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Minimum spacing between the starts of two push cycles
    pub throttle: Duration,
    /// Per-send write deadline
    pub write_timeout: Duration,
    /// Keepalive ping interval per connection
    pub ping_interval: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            throttle: DEFAULT_THROTTLE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

impl StateConfig {
    fn normalized(mut self) -> Self {
        if self.throttle < MIN_THROTTLE {
            self.throttle = DEFAULT_THROTTLE;
        }
        if self.write_timeout.is_zero() {
            self.write_timeout = DEFAULT_WRITE_TIMEOUT;
        }
        if self.ping_interval.is_zero() {
            self.ping_interval = DEFAULT_PING_INTERVAL;
        }
        self
    }
}

/// State statistics.
#[derive(Debug, Clone, Default)]
pub struct StateStats {
    pub push_cycles: u64,
    pub versions_published: u64,
    pub total_connections: u64,
    pub active_connections: u64,
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error(transparent)]
    Owner(#[from] OwnerError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("versioned state needs a tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// The published document, shared read-only with connections.
pub(crate) struct Published {
    id: String,
    frame: RwLock<Frame>,
}

struct Frame {
    snapshot: Option<Arc<RawValue>>,
    // Valid only as the step from `version - 1` to `version`.
    delta: Option<Arc<RawValue>>,
    version: u64,
    patcher: MergePatcher,
}

impl Published {
    pub(crate) fn new(initial: Box<RawValue>) -> Self {
        let mut patcher = MergePatcher::new();
        let snapshot = if initial.get() == "null" {
            None
        } else {
            if let Err(e) = patcher.seed(initial.get()) {
                log::warn!("initial document could not be cached for diffing: {e}");
            }
            Some(Arc::from(initial))
        };
        Self {
            id: Uuid::new_v4().simple().to_string(),
            frame: RwLock::new(Frame {
                snapshot,
                delta: None,
                version: 1,
                patcher,
            }),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn version(&self) -> u64 {
        self.frame.read().version
    }

    /// Record a freshly serialized document. Returns whether the version
    /// moved, and the current version.
    fn publish(&self, document: Box<RawValue>) -> (bool, u64) {
        let mut guard = self.frame.write();
        let frame = &mut *guard;

        let changed = if document.get() == "null" {
            frame.snapshot = None;
            frame.delta = None;
            frame.patcher.reset();
            true
        } else {
            match frame.patcher.patch(document.get()) {
                Ok(patch) if patch.is_empty() && frame.snapshot.is_some() => false,
                Ok(patch) => {
                    // After a clear there is no base for a delta.
                    frame.delta = match frame.snapshot {
                        Some(_) => serde_json::value::to_raw_value(&patch).ok().map(Arc::from),
                        None => None,
                    };
                    frame.snapshot = Some(Arc::from(document));
                    true
                }
                Err(MergeError::NotObject) => {
                    let changed = frame.snapshot.as_deref().map(RawValue::get) != Some(document.get());
                    if changed {
                        frame.delta = None;
                        frame.snapshot = Some(Arc::from(document));
                    }
                    changed
                }
                Err(e) => {
                    log::error!("state {}: {e}", self.id);
                    false
                }
            }
        };

        if changed {
            frame.version += 1;
        }
        (changed, frame.version)
    }

    /// The update that brings a connection at `acked` up to date, or `None`
    /// if it already is.
    pub(crate) fn update_for(&self, acked: u64) -> Option<Update> {
        let frame = self.frame.read();
        if acked == frame.version {
            return None;
        }
        let update = match (&frame.snapshot, &frame.delta) {
            (Some(snapshot), Some(delta))
                if acked.checked_add(1) == Some(frame.version)
                    && delta.get().len() < snapshot.get().len() =>
            {
                Update::delta(frame.version, Arc::clone(delta))
            }
            _ => Update::snapshot(frame.version, frame.snapshot.clone()),
        };
        Some(update)
    }
}

struct Shared<S> {
    me: Weak<Shared<S>>,
    source: S,
    config: StateConfig,
    published: Arc<Published>,
    pushing: AtomicBool,
    queued: AtomicBool,
    conns: Mutex<HashMap<u64, Arc<Connection>>>,
    next_conn_id: AtomicU64,
    push_cycles: AtomicU64,
    versions_published: AtomicU64,
    total_connections: AtomicU64,
    runtime: Handle,
}

impl<S: Source> Shared<S> {
    fn request_push(&self) -> bool {
        if self
            .pushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.queued.store(true, Ordering::Release);
            return false;
        }
        match self.me.upgrade() {
            Some(me) => {
                self.runtime.spawn(me.run_push());
                true
            }
            None => {
                self.pushing.store(false, Ordering::Release);
                false
            }
        }
    }

    async fn run_push(self: Arc<Self>) {
        let started = Instant::now();
        self.push_cycle();

        let remaining = self.config.throttle.saturating_sub(started.elapsed());
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }

        self.pushing.store(false, Ordering::Release);
        if self.queued.swap(false, Ordering::AcqRel) {
            self.request_push();
        }
    }

    fn push_cycle(&self) {
        self.push_cycles.fetch_add(1, Ordering::Relaxed);

        let document = match self.source.snapshot() {
            Ok(document) => document,
            Err(e) => {
                log::error!("state {}: {e}; push skipped", self.published.id());
                return;
            }
        };

        let (changed, version) = self.published.publish(document);
        if changed {
            self.versions_published.fetch_add(1, Ordering::Relaxed);
            log::debug!("state {} now at version {version}", self.published.id());
        }

        let stale: Vec<Arc<Connection>> = self
            .conns
            .lock()
            .values()
            .filter(|conn| conn.version() != version)
            .cloned()
            .collect();
        for conn in stale {
            self.runtime.spawn(async move { conn.push().await });
        }
    }
}

impl<S: Source> Pusher for Shared<S> {
    fn push(&self) -> bool {
        self.request_push()
    }
}

/// A synchronized object plus everything needed to publish it: the current
/// snapshot and delta, the version counter, a random id, the push scheduler
/// and the set of live connections.
///
/// Cheap to clone; clones share the same state.
pub struct VersionedState<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for VersionedState<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Source> VersionedState<S> {
    /// Serialize `source` once, bind its containers to this state's push
    /// scheduler and start at version 1.
    ///
    /// Must be called inside a tokio runtime; pushes are spawned onto it.
    pub fn new(source: S, config: StateConfig) -> Result<Self, StateError> {
        let runtime = Handle::try_current()?;
        let config = config.normalized();
        let published = Arc::new(Published::new(source.snapshot()?));

        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            source,
            config,
            published,
            pushing: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            conns: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
            push_cycles: AtomicU64::new(0),
            versions_published: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            runtime,
        });

        let pusher: Weak<Shared<S>> = Arc::downgrade(&shared);
        let bound = shared.source.bind(pusher)?;
        log::info!(
            "state {} ready ({bound} reactive containers, throttle {:?})",
            shared.published.id(),
            shared.config.throttle
        );

        Ok(Self { shared })
    }

    /// Create with default configuration.
    pub fn with_defaults(source: S) -> Result<Self, StateError> {
        Self::new(source, StateConfig::default())
    }

    /// Random identifier of this state, stable for the life of the process.
    pub fn id(&self) -> &str {
        self.shared.published.id()
    }

    pub fn version(&self) -> u64 {
        self.shared.published.version()
    }

    pub fn config(&self) -> &StateConfig {
        &self.shared.config
    }

    pub fn source(&self) -> &S {
        &self.shared.source
    }

    /// Request a push. Returns `true` if a new cycle started, `false` if the
    /// request was folded into the cycle already running.
    pub fn push(&self) -> bool {
        self.shared.request_push()
    }

    pub fn num_connections(&self) -> usize {
        self.shared.conns.lock().len()
    }

    pub fn stats(&self) -> StateStats {
        StateStats {
            push_cycles: self.shared.push_cycles.load(Ordering::Relaxed),
            versions_published: self.shared.versions_published.load(Ordering::Relaxed),
            total_connections: self.shared.total_connections.load(Ordering::Relaxed),
            active_connections: self.num_connections() as u64,
        }
    }

    /// Attach a connected transport: send the initial ping, start the
    /// keepalive loop, subscribe, and push the current state.
    ///
    /// A `hint` naming this state lets the connection start at the hinted
    /// version so its next update can be a delta.
    pub async fn accept<T>(&self, transport: T, hint: &ResumeHint) -> Result<Arc<Connection>, TransportError>
    where
        T: Transport + 'static,
    {
        // A hint ahead of the published version cannot be ours.
        let start = match hint.start_version(self.id()) {
            v if v > self.version() => 0,
            v => v,
        };
        let id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Arc::new(Connection::new(
            id,
            Box::new(transport),
            Arc::clone(&self.shared.published),
            &self.shared.config,
            start,
        ));

        conn.connect().await?;
        self.subscribe(&conn);
        conn.push().await;
        Ok(conn)
    }

    /// [`accept`](Self::accept), then wait until the connection closes.
    pub async fn serve<T>(&self, transport: T, hint: &ResumeHint) -> Result<(), TransportError>
    where
        T: Transport + 'static,
    {
        let conn = self.accept(transport, hint).await?;
        conn.wait().await;
        Ok(())
    }

    fn subscribe(&self, conn: &Arc<Connection>) {
        self.shared.conns.lock().insert(conn.id(), Arc::clone(conn));
        self.shared.total_connections.fetch_add(1, Ordering::Relaxed);

        let shared = Arc::downgrade(&self.shared);
        let conn = Arc::clone(conn);
        self.shared.runtime.spawn(async move {
            conn.wait().await;
            if let Some(shared) = shared.upgrade() {
                shared.conns.lock().remove(&conn.id());
            }
            log::info!("connection {} closed", conn.id());
        });
    }
}
