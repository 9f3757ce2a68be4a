//! TTL and size bounded LRU cache for operation results
//!
//! Entries sit in an `IndexMap` ordered by recency: the back is the most
//! recently used entry and the front is the eviction candidate. Reads move an
//! entry to the back; inserting into a full cache evicts the front.
//!
//! An entry is fresh while `now - stored_at < ttl`. Stale entries are never
//! returned and are removed when read or by [`ResultCache::purge_expired`].
//!
//! The cache itself is not synchronized; [`ResilientExecutor`](crate::ResilientExecutor)
//! keeps it behind a mutex.

use std::time::Duration;

use indexmap::IndexMap;
use tokio::time::Instant;

/// Cache sizing
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time an entry stays readable
    pub ttl: Duration,
    /// Maximum number of live entries
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 1000,
        }
    }
}

impl CacheConfig {
    /// Set the TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the capacity
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() >= ttl
    }
}

/// LRU cache with per-entry TTL
#[derive(Debug)]
pub struct ResultCache<V> {
    config: CacheConfig,
    entries: IndexMap<String, CacheEntry<V>>,
}

impl<V: Clone> ResultCache<V> {
    /// Create an empty cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: IndexMap::with_capacity(config.max_entries),
            config,
        }
    }

    /// Number of entries, including stale ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configuration in use
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Read a fresh entry and mark it most recently used
    pub fn get(&mut self, key: &str) -> Option<V> {
        let idx = self.entries.get_index_of(key)?;
        let (_, entry) = self.entries.get_index(idx)?;
        if entry.is_expired(self.config.ttl) {
            self.entries.shift_remove_index(idx);
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.move_index(idx, last);
        self.entries.get_index(last).map(|(_, e)| e.value.clone())
    }

    /// Insert or replace an entry.
    ///
    /// Returns the key evicted to make room, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Option<String> {
        let key = key.into();
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
        };

        if self.entries.shift_remove(&key).is_some() {
            self.entries.insert(key, entry);
            return None;
        }

        let evicted = if self.entries.len() >= self.config.max_entries {
            self.entries.shift_remove_index(0).map(|(k, _)| k)
        } else {
            None
        };
        self.entries.insert(key, entry);
        evicted
    }

    /// Remove an entry, returning its value if present
    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.shift_remove(key).map(|e| e.value)
    }

    /// Drop every entry whose TTL has elapsed. Returns how many were dropped.
    pub fn purge_expired(&mut self) -> usize {
        let ttl = self.config.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(ttl));
        before - self.entries.len()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Keys from most to least recently used
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.entries.keys().rev().cloned().collect()
    }
}
