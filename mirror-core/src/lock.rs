//! Lock and push capabilities shared between a synchronized object and
//! the containers inside it.
//!
//! A [`Locker`] is the one lock protecting the caller's object. Reactive
//! containers hold a weak reference to it and take it around every read and
//! write. A [`Pusher`] is notified after every container write.

use std::sync::{Arc, Weak};

/// An RAII token for a held lock. Dropping it releases the lock.
pub struct LockGuard<'a> {
    _held: Box<dyn Held + 'a>,
}

trait Held {}

impl<T> Held for T {}

impl<'a> LockGuard<'a> {
    pub fn new<G: 'a>(guard: G) -> Self {
        Self {
            _held: Box::new(guard),
        }
    }
}

/// The lock protecting a synchronized object.
///
/// `read` defaults to the exclusive lock. Implementations with read/write
/// separation override it.
pub trait Locker: Send + Sync {
    fn lock(&self) -> LockGuard<'_>;

    fn read(&self) -> LockGuard<'_> {
        self.lock()
    }
}

impl<T: Send> Locker for parking_lot::Mutex<T> {
    fn lock(&self) -> LockGuard<'_> {
        LockGuard::new(parking_lot::Mutex::lock(self))
    }
}

impl<T: Send + Sync> Locker for parking_lot::RwLock<T> {
    fn lock(&self) -> LockGuard<'_> {
        LockGuard::new(self.write())
    }

    fn read(&self) -> LockGuard<'_> {
        LockGuard::new(parking_lot::RwLock::read(self))
    }
}

/// Receives change notifications.
///
/// Returns `true` if the notification started a new push and `false` if it
/// was folded into one already in flight.
pub trait Pusher: Send + Sync {
    fn push(&self) -> bool;
}

/// The lock and pusher a container is bound to.
///
/// Both references are weak: the owner of the lock and the pusher also owns
/// the containers, so strong references would form a cycle.
#[derive(Clone, Default)]
pub struct Binding {
    locker: Option<Weak<dyn Locker>>,
    pusher: Option<Weak<dyn Pusher>>,
}

impl Binding {
    pub fn new(locker: Option<Weak<dyn Locker>>, pusher: Option<Weak<dyn Pusher>>) -> Self {
        Self { locker, pusher }
    }

    /// The bound lock, if any and still alive.
    pub fn locker(&self) -> Option<Arc<dyn Locker>> {
        self.locker.as_ref().and_then(Weak::upgrade)
    }

    /// Notify the bound pusher. Returns `false` when unbound.
    pub fn push(&self) -> bool {
        match self.pusher.as_ref().and_then(Weak::upgrade) {
            Some(pusher) => pusher.push(),
            None => false,
        }
    }

    pub fn has_pusher(&self) -> bool {
        self.pusher.is_some()
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("locker", &self.locker.is_some())
            .field("pusher", &self.pusher.is_some())
            .finish()
    }
}
