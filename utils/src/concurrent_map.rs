//! A reader/writer-locked associative container.

use crate::Error;
use std::{collections::HashMap, hash::Hash, sync::RwLock};

/// A thread-safe map with insert-if-absent semantics.
///
/// Concurrent [ConcurrentMap::get] and [ConcurrentMap::keys] calls never
/// block each other; [ConcurrentMap::insert] and [ConcurrentMap::remove]
/// take the write lock and are mutually exclusive with everything else.
pub struct ConcurrentMap<K: Eq + Hash + Clone, V: Clone> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Default for ConcurrentMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> ConcurrentMap<K, V> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a value for a key that must not already be present.
    pub fn insert(&self, key: K, value: V) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        if inner.contains_key(&key) {
            return Err(Error::AlreadyExists);
        }
        inner.insert(key, value);
        Ok(())
    }

    /// Clone out the value stored for a key.
    pub fn get(&self, key: &K) -> Result<V, Error> {
        self.inner
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(Error::DoesNotExist)
    }

    /// Remove and return the value stored for a key.
    pub fn remove(&self, key: &K) -> Result<V, Error> {
        self.inner
            .write()
            .unwrap()
            .remove(key)
            .ok_or(Error::DoesNotExist)
    }

    /// An unordered snapshot of the keys currently present.
    pub fn keys(&self) -> Vec<K> {
        self.inner.read().unwrap().keys().cloned().collect()
    }

    /// Number of entries currently present.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}
