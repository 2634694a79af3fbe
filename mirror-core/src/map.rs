//! Reactive key/value map.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::bind::{BindError, Bindable, Binder, Reactive};
use crate::lock::Binding;

/// A map that takes the owning object's lock around every access and
/// notifies its pusher after every write.
///
/// `SyncMap` is a handle: clones share the same entries, so a handle taken
/// out of the locked object can be used after the object's guard is
/// released. Calling a method while holding that same guard deadlocks.
///
/// Serializes as a bare JSON object. Deserializing always produces a fresh
/// map, so keys absent from the input are gone.
pub struct SyncMap<K, V> {
    inner: Arc<Shared<K, V>>,
}

struct Shared<K, V> {
    binding: RwLock<Binding>,
    // Only taken while the bound lock is held, or during serialization
    // under the owner's lock.
    entries: Mutex<BTreeMap<K, V>>,
}

impl<K: Ord, V> SyncMap<K, V> {
    pub fn new() -> Self {
        Self::from(BTreeMap::new())
    }

    fn read<R>(&self, f: impl FnOnce(&BTreeMap<K, V>) -> R) -> R {
        let binding = self.inner.binding.read().clone();
        let locker = binding.locker();
        let _guard = locker.as_deref().map(|l| l.read());
        let entries = self.inner.entries.lock();
        f(&*entries)
    }

    fn write<R>(&self, f: impl FnOnce(&mut BTreeMap<K, V>) -> R) -> R {
        let binding = self.inner.binding.read().clone();
        let locker = binding.locker();
        let _guard = locker.as_deref().map(|l| l.lock());
        let out = f(&mut *self.inner.entries.lock());
        binding.push();
        out
    }

    pub fn len(&self) -> usize {
        self.read(|m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.read(|m| m.is_empty())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.read(|m| m.contains_key(key))
    }

    /// Visit entries in key order until `f` returns `false`.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V) -> bool) {
        self.read(|m| {
            for (k, v) in m {
                if !f(k, v) {
                    break;
                }
            }
        })
    }

    /// Insert or replace a value and push.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.write(|m| m.insert(key, value))
    }

    /// Remove a key and push.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.write(|m| m.remove(key))
    }

    /// Mutate an existing value in place. Returns `false` (and does not
    /// push) when the key is missing.
    pub fn update(&self, key: &K, f: impl FnOnce(&mut V)) -> bool {
        let binding = self.inner.binding.read().clone();
        let locker = binding.locker();
        let _guard = locker.as_deref().map(|l| l.lock());
        let found = match self.inner.entries.lock().get_mut(key) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        };
        if found {
            binding.push();
        }
        found
    }

    /// Apply several edits under one lock acquisition with a single push.
    pub fn batch<R>(&self, f: impl FnOnce(&mut BTreeMap<K, V>) -> R) -> R {
        self.write(f)
    }

    pub fn clear(&self) {
        self.write(|m| m.clear())
    }
}

impl<K: Ord + Clone, V: Clone> SyncMap<K, V> {
    pub fn get(&self, key: &K) -> Option<V> {
        self.read(|m| m.get(key).cloned())
    }

    pub fn keys(&self) -> Vec<K> {
        self.read(|m| m.keys().cloned().collect())
    }

    pub fn values(&self) -> Vec<V> {
        self.read(|m| m.values().cloned().collect())
    }

    /// Copy of the current entries.
    pub fn snapshot(&self) -> BTreeMap<K, V> {
        self.read(|m| m.clone())
    }
}

impl<K, V> From<BTreeMap<K, V>> for SyncMap<K, V> {
    fn from(entries: BTreeMap<K, V>) -> Self {
        Self {
            inner: Arc::new(Shared {
                binding: RwLock::new(Binding::default()),
                entries: Mutex::new(entries),
            }),
        }
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for SyncMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<BTreeMap<K, V>>())
    }
}

impl<K: Ord, V> Default for SyncMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for SyncMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Reactive for SyncMap<K, V> {
    fn bind(&self, binding: &Binding) {
        *self.inner.binding.write() = binding.clone();
    }
}

impl<K, V> Bindable for SyncMap<K, V> {
    fn bind_fields(&self, binder: &mut Binder<'_>) -> Result<(), BindError> {
        binder.container(self);
        Ok(())
    }
}

// No bound lock is taken here: serialization runs inside the owner's lock.
impl<K: Serialize, V: Serialize> Serialize for SyncMap<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.inner.entries.lock().serialize(serializer)
    }
}

impl<'de, K, V> Deserialize<'de> for SyncMap<K, V>
where
    K: Ord + Deserialize<'de>,
    V: Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        BTreeMap::deserialize(deserializer).map(Self::from)
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for SyncMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.entries.lock().iter()).finish()
    }
}
