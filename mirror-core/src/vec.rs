//! Reactive ordered list.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::bind::{BindError, Bindable, Binder, Reactive};
use crate::lock::Binding;

/// The list counterpart of [`SyncMap`](crate::map::SyncMap): every access
/// takes the bound lock, every write pushes once.
///
/// Serializes as a bare JSON array.
pub struct SyncVec<V> {
    inner: Arc<Shared<V>>,
}

struct Shared<V> {
    binding: RwLock<Binding>,
    items: Mutex<Vec<V>>,
}

impl<V> SyncVec<V> {
    pub fn new() -> Self {
        Self::from(Vec::new())
    }

    fn read<R>(&self, f: impl FnOnce(&Vec<V>) -> R) -> R {
        let binding = self.inner.binding.read().clone();
        let locker = binding.locker();
        let _guard = locker.as_deref().map(|l| l.read());
        let items = self.inner.items.lock();
        f(&*items)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Vec<V>) -> R) -> R {
        let binding = self.inner.binding.read().clone();
        let locker = binding.locker();
        let _guard = locker.as_deref().map(|l| l.lock());
        let out = f(&mut *self.inner.items.lock());
        binding.push();
        out
    }

    // Writes that can miss: push only when `f` reports a change.
    fn try_write(&self, f: impl FnOnce(&mut Vec<V>) -> bool) -> bool {
        let binding = self.inner.binding.read().clone();
        let locker = binding.locker();
        let _guard = locker.as_deref().map(|l| l.lock());
        let changed = f(&mut *self.inner.items.lock());
        if changed {
            binding.push();
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.read(|v| v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.read(|v| v.is_empty())
    }

    /// Visit items in order until `f` returns `false`.
    pub fn for_each(&self, mut f: impl FnMut(usize, &V) -> bool) {
        self.read(|items| {
            for (i, item) in items.iter().enumerate() {
                if !f(i, item) {
                    break;
                }
            }
        })
    }

    /// Replace all items.
    pub fn replace(&self, items: Vec<V>) {
        self.write(|v| *v = items)
    }

    pub fn push(&self, item: V) {
        self.write(|v| v.push(item))
    }

    pub fn extend(&self, items: impl IntoIterator<Item = V>) {
        self.write(|v| v.extend(items))
    }

    /// Overwrite the item at `index`. Returns `false` when out of bounds.
    pub fn set(&self, index: usize, item: V) -> bool {
        self.try_write(|v| match v.get_mut(index) {
            Some(slot) => {
                *slot = item;
                true
            }
            None => false,
        })
    }

    /// Remove the item at `index`, shifting later items down.
    pub fn remove(&self, index: usize) -> bool {
        self.try_write(|v| {
            if index < v.len() {
                v.remove(index);
                true
            } else {
                false
            }
        })
    }

    pub fn update(&self, index: usize, f: impl FnOnce(&mut V)) -> bool {
        self.try_write(|v| match v.get_mut(index) {
            Some(item) => {
                f(item);
                true
            }
            None => false,
        })
    }

    /// Apply several edits with a single push.
    pub fn batch<R>(&self, f: impl FnOnce(&mut Vec<V>) -> R) -> R {
        self.write(f)
    }

    pub fn clear(&self) {
        self.write(|v| v.clear())
    }
}

impl<V: Clone> SyncVec<V> {
    pub fn get(&self, index: usize) -> Option<V> {
        self.read(|v| v.get(index).cloned())
    }

    /// Copy of the current items.
    pub fn to_vec(&self) -> Vec<V> {
        self.read(|v| v.clone())
    }
}

impl<V> From<Vec<V>> for SyncVec<V> {
    fn from(items: Vec<V>) -> Self {
        Self {
            inner: Arc::new(Shared {
                binding: RwLock::new(Binding::default()),
                items: Mutex::new(items),
            }),
        }
    }
}

impl<V> FromIterator<V> for SyncVec<V> {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<V>>())
    }
}

impl<V> Default for SyncVec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for SyncVec<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Reactive for SyncVec<V> {
    fn bind(&self, binding: &Binding) {
        *self.inner.binding.write() = binding.clone();
    }
}

impl<V> Bindable for SyncVec<V> {
    fn bind_fields(&self, binder: &mut Binder<'_>) -> Result<(), BindError> {
        binder.container(self);
        Ok(())
    }
}

impl<V: Serialize> Serialize for SyncVec<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.inner.items.lock().serialize(serializer)
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for SyncVec<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::deserialize(deserializer).map(Self::from)
    }
}

impl<V: fmt::Debug> fmt::Debug for SyncVec<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.inner.items.lock().iter()).finish()
    }
}
