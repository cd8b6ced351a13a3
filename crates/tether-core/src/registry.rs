//! Concurrency-safe keyed registries.
//!
//! Every shared map in the crate (connections by id, users by identity,
//! topic subscribers, command handlers, pending requests) is a [`Registry`].
//! Reads take the shared lock and copy out before returning, so callers never
//! hold a registry lock while running handlers or writing to a stream.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::RwLock;

/// A `HashMap` behind a reader/writer lock.
pub struct Registry<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a value, returning the previous one.
    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.entries.write().insert(key, value)
    }

    /// Remove a value, returning it if it was present.
    pub fn delete(&self, key: &K) -> Option<V> {
        self.entries.write().remove(key)
    }

    /// Remove a value only if `pred` holds for it.
    pub fn remove_if(&self, key: &K, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(pred) {
            entries.remove(key)
        } else {
            None
        }
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Run `f` with exclusive access to the underlying map.
    ///
    /// Keep the closure short: it runs under the write lock.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        f(&mut self.entries.write())
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Point lookup.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    /// Atomically look up `key`, inserting `make()` if it is absent.
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
        if let Some(v) = self.entries.read().get(&key) {
            return v.clone();
        }
        self.entries.write().entry(key).or_insert_with(make).clone()
    }

    /// Point-in-time copy of the whole map.
    pub fn copy(&self) -> HashMap<K, V> {
        self.entries.read().clone()
    }

    /// Point-in-time copy of the values.
    pub fn values(&self) -> Vec<V> {
        self.entries.read().values().cloned().collect()
    }

    /// Point-in-time copy of the keys.
    pub fn keys(&self) -> Vec<K> {
        self.entries.read().keys().cloned().collect()
    }
}

impl<K, T> Registry<K, Vec<T>>
where
    K: Eq + Hash,
{
    /// Append `item` to the list stored under `key`, creating it if needed.
    pub fn append(&self, key: K, item: T) {
        self.entries.write().entry(key).or_default().push(item);
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
