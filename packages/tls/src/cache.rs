//! Bounded, read-mostly cache shared by the credential caches
//!
//! Values are published as whole `Arc`s, so a reader either sees a complete
//! entry or none. Concurrent loads of the same key may race; the last writer
//! wins. When the cache is full the oldest entry is evicted.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Default number of entries kept per cache
pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug)]
struct CacheEntry<V> {
    value: Arc<V>,
    inserted_at: Instant,
}

/// Capacity-bounded map from keys to shared credential values
#[derive(Debug)]
pub struct CredentialCache<K, V> {
    name: &'static str,
    capacity: usize,
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
}

impl<K, V> CredentialCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache holding at most `capacity` entries (minimum one)
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            entries: RwLock::new(HashMap::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            cache_hits: AtomicUsize::new(0),
            cache_misses: AtomicUsize::new(0),
        }
    }

    /// Look up a key, counting the hit or miss
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let found = self.read().get(key).map(|entry| Arc::clone(&entry.value));
        if found.is_some() {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Publish a value, evicting the oldest entry if the cache is full
    pub fn insert(&self, key: K, value: Arc<V>) {
        let mut entries = self.write();
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                tracing::debug!("{} cache full, evicted oldest entry", self.name);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop one entry, returning it if present
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.write().remove(key).map(|entry| entry.value)
    }

    /// Drop every entry older than `max_age`, returning how many were removed
    pub fn purge(&self, max_age: Duration) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted_at.elapsed() <= max_age);
        let removed = before - entries.len();
        tracing::debug!(
            "{} cache purge completed, {} removed, {} remaining",
            self.name,
            removed,
            entries.len()
        );
        removed
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Maximum number of entries
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cache statistics as `(hits, misses)`
    #[must_use]
    pub fn stats(&self) -> (usize, usize) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, CacheEntry<V>>> {
        match self.entries.read() {
            Ok(entries) => entries,
            Err(poisoned) => {
                tracing::warn!("{} cache read lock poisoned, recovering", self.name);
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, CacheEntry<V>>> {
        match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => {
                tracing::warn!("{} cache write lock poisoned, recovering", self.name);
                poisoned.into_inner()
            }
        }
    }
}
