//! # mirror-core — Runtime-free building blocks for live state sync
//!
//! Everything here is synchronous and transport-agnostic. The async engine
//! in `mirror-sync` wires these pieces to connections.
//!
//! ```text
//!   caller's object ─── Source::snapshot ──► JSON text
//!   ┌──────────────┐                              │
//!   │ SyncMap      │── write ─► Pusher::push      ▼
//!   │ SyncVec      │                        MergePatcher ──► merge patch
//!   └──────────────┘                              │
//!          ▲                                      ▼
//!          └──── Binder (lock + pusher) ◄── Update { id, version, delta, body }
//! ```
//!
//! ## Modules
//!
//! - [`merge`] — merge-patch diff/apply and the parsed-document cache
//! - [`lock`] — lock and push capabilities, container bindings
//! - [`bind`] — explicit walk over an object's reactive fields
//! - [`map`], [`vec`] — reactive containers
//! - [`owner`] — server [`Source`] and client [`Mirror`] adapters
//! - [`protocol`] — the JSON wire message

pub mod bind;
pub mod lock;
pub mod map;
pub mod merge;
pub mod owner;
pub mod protocol;
pub mod vec;

// Re-exports for convenience
pub use bind::{BindError, Bindable, Binder, Reactive};
pub use lock::{Binding, LockGuard, Locker, Pusher};
pub use map::SyncMap;
pub use merge::{apply, diff, Document, MergeError, MergePatcher};
pub use owner::{Mirror, OwnerError, Source, Unlocked};
pub use protocol::{ProtocolError, ResumeHint, Update};
pub use vec::SyncVec;
