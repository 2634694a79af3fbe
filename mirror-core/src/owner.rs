//! Adapters between the caller's object and the sync engine.
//!
//! - [`Source`]: the server side. Serializes the object under its lock and
//!   binds its containers to the engine's pusher.
//! - [`Mirror`]: the client side. Replaces the object's contents with a
//!   received document, then rebinds its containers to the object's lock.
//!
//! Both are implemented for `Arc<parking_lot::RwLock<T>>` (reads take the
//! shared side) and `Arc<parking_lot::Mutex<T>>`. [`Unlocked`] serves
//! objects whose only mutable state lives in reactive containers.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use thiserror::Error;

use crate::bind::{BindError, Bindable, Binder};
use crate::lock::{Binding, Locker, Pusher};

#[derive(Error, Debug)]
pub enum OwnerError {
    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize state: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error(transparent)]
    Bind(#[from] BindError),
}

/// The authoritative object on the server.
pub trait Source: Send + Sync + 'static {
    /// Serialize the object while holding its lock (shared side if it has one).
    fn snapshot(&self) -> Result<Box<RawValue>, OwnerError>;

    /// Bind every reachable container to this object's lock and `pusher`.
    fn bind(&self, pusher: Weak<dyn Pusher>) -> Result<usize, BindError>;
}

/// The local copy kept by a client.
pub trait Mirror: Send + Sync + 'static {
    /// Replace the object with `document`, dropping anything it omits.
    fn replace(&self, document: &str) -> Result<(), OwnerError>;

    /// Reset the object to its default value.
    fn reset(&self);
}

fn locker_of<L: Locker + 'static>(lock: &Arc<L>) -> Weak<dyn Locker> {
    let weak: Weak<L> = Arc::downgrade(lock);
    weak
}

impl<T> Source for Arc<RwLock<T>>
where
    T: Serialize + Bindable + Send + Sync + 'static,
{
    fn snapshot(&self) -> Result<Box<RawValue>, OwnerError> {
        let guard = self.read();
        serde_json::value::to_raw_value(&*guard).map_err(OwnerError::Serialize)
    }

    fn bind(&self, pusher: Weak<dyn Pusher>) -> Result<usize, BindError> {
        let binding = Binding::new(Some(locker_of(self)), Some(pusher));
        let guard = self.read();
        Binder::bind_root(&*guard, &binding)
    }
}

impl<T> Source for Arc<Mutex<T>>
where
    T: Serialize + Bindable + Send + 'static,
{
    fn snapshot(&self) -> Result<Box<RawValue>, OwnerError> {
        let guard = self.lock();
        serde_json::value::to_raw_value(&*guard).map_err(OwnerError::Serialize)
    }

    fn bind(&self, pusher: Weak<dyn Pusher>) -> Result<usize, BindError> {
        let binding = Binding::new(Some(locker_of(self)), Some(pusher));
        let guard = self.lock();
        Binder::bind_root(&*guard, &binding)
    }
}

impl<T> Mirror for Arc<RwLock<T>>
where
    T: DeserializeOwned + Bindable + Default + Send + Sync + 'static,
{
    fn replace(&self, document: &str) -> Result<(), OwnerError> {
        let fresh: T = serde_json::from_str(document).map_err(OwnerError::Deserialize)?;
        let binding = Binding::new(Some(locker_of(self)), None);
        let mut guard = self.write();
        *guard = fresh;
        Binder::bind_root(&*guard, &binding)?;
        Ok(())
    }

    fn reset(&self) {
        let binding = Binding::new(Some(locker_of(self)), None);
        let mut guard = self.write();
        *guard = T::default();
        if let Err(e) = Binder::bind_root(&*guard, &binding) {
            log::warn!("rebinding after reset failed: {e}");
        }
    }
}

impl<T> Mirror for Arc<Mutex<T>>
where
    T: DeserializeOwned + Bindable + Default + Send + 'static,
{
    fn replace(&self, document: &str) -> Result<(), OwnerError> {
        let fresh: T = serde_json::from_str(document).map_err(OwnerError::Deserialize)?;
        let binding = Binding::new(Some(locker_of(self)), None);
        let mut guard = self.lock();
        *guard = fresh;
        Binder::bind_root(&*guard, &binding)?;
        Ok(())
    }

    fn reset(&self) {
        let binding = Binding::new(Some(locker_of(self)), None);
        let mut guard = self.lock();
        *guard = T::default();
        if let Err(e) = Binder::bind_root(&*guard, &binding) {
            log::warn!("rebinding after reset failed: {e}");
        }
    }
}

/// An object without a lock of its own.
///
/// Only sound when all mutable state sits in reactive containers: each
/// container then serializes under its own internal lock.
pub struct Unlocked<T>(pub Arc<T>);

impl<T> Unlocked<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(value))
    }
}

impl<T> Clone for Unlocked<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> std::ops::Deref for Unlocked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> Source for Unlocked<T>
where
    T: Serialize + Bindable + Send + Sync + 'static,
{
    fn snapshot(&self) -> Result<Box<RawValue>, OwnerError> {
        serde_json::value::to_raw_value(&*self.0).map_err(OwnerError::Serialize)
    }

    fn bind(&self, pusher: Weak<dyn Pusher>) -> Result<usize, BindError> {
        Binder::bind_root(&*self.0, &Binding::new(None, Some(pusher)))
    }
}
