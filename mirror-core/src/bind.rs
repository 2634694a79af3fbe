//! Container binding.
//!
//! A synchronized object lists its reactive sub-fields through
//! [`Bindable::bind_fields`]. The [`Binder`] walks that listing from the
//! root and hands every container the root's [`Binding`].
//!
//! Nested values that carry their own lock are rejected: the root lock
//! already covers them during serialization, so a second lock would either
//! deadlock against it or let writers slip past it.

use std::sync::Arc;

use thiserror::Error;

use crate::lock::Binding;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("nested type {type_name} declares its own lock; use SyncMap/SyncVec under the root lock instead")]
    NestedLock { type_name: &'static str },
}

/// A container that routes its reads and writes through a [`Binding`].
pub trait Reactive {
    fn bind(&self, binding: &Binding);
}

/// A value that may contain reactive containers.
///
/// The default implementation has no reactive fields, so plain data types
/// only need an empty `impl Bindable for T {}`.
pub trait Bindable {
    /// Whether this value carries its own independent lock.
    fn declares_lock(&self) -> bool {
        false
    }

    fn bind_fields(&self, _binder: &mut Binder<'_>) -> Result<(), BindError> {
        Ok(())
    }
}

/// Walks a [`Bindable`] graph and binds every container it reaches.
pub struct Binder<'a> {
    binding: &'a Binding,
    bound: usize,
}

impl<'a> Binder<'a> {
    /// Bind everything reachable from `root`. Returns the number of
    /// containers bound.
    ///
    /// The root itself may declare a lock; that lock is the one the binding
    /// refers to.
    pub fn bind_root<T: Bindable + ?Sized>(root: &T, binding: &'a Binding) -> Result<usize, BindError> {
        let mut binder = Binder { binding, bound: 0 };
        root.bind_fields(&mut binder)?;
        log::debug!("bound {} reactive containers", binder.bound);
        Ok(binder.bound)
    }

    /// Bind one container.
    pub fn container(&mut self, container: &dyn Reactive) -> &mut Self {
        container.bind(self.binding);
        self.bound += 1;
        self
    }

    /// Descend into a nested value.
    pub fn nested<T: Bindable + ?Sized>(&mut self, value: &T) -> Result<&mut Self, BindError> {
        if value.declares_lock() {
            return Err(BindError::NestedLock {
                type_name: std::any::type_name::<T>(),
            });
        }
        value.bind_fields(self)?;
        Ok(self)
    }
}

impl<T: Bindable> Bindable for Option<T> {
    fn declares_lock(&self) -> bool {
        self.as_ref().is_some_and(Bindable::declares_lock)
    }

    fn bind_fields(&self, binder: &mut Binder<'_>) -> Result<(), BindError> {
        match self {
            Some(value) => value.bind_fields(binder),
            None => Ok(()),
        }
    }
}

impl<T: Bindable + ?Sized> Bindable for Box<T> {
    fn declares_lock(&self) -> bool {
        (**self).declares_lock()
    }

    fn bind_fields(&self, binder: &mut Binder<'_>) -> Result<(), BindError> {
        (**self).bind_fields(binder)
    }
}

impl<T: Bindable + ?Sized> Bindable for Arc<T> {
    fn declares_lock(&self) -> bool {
        (**self).declares_lock()
    }

    fn bind_fields(&self, binder: &mut Binder<'_>) -> Result<(), BindError> {
        (**self).bind_fields(binder)
    }
}

impl<T> Bindable for parking_lot::Mutex<T> {
    fn declares_lock(&self) -> bool {
        true
    }
}

impl<T> Bindable for parking_lot::RwLock<T> {
    fn declares_lock(&self) -> bool {
        true
    }
}

impl<T> Bindable for std::sync::Mutex<T> {
    fn declares_lock(&self) -> bool {
        true
    }
}

impl<T> Bindable for std::sync::RwLock<T> {
    fn declares_lock(&self) -> bool {
        true
    }
}

impl Bindable for serde_json::Value {}

impl Bindable for serde_json::Map<String, serde_json::Value> {}
