//! # Embed Cache
//!
//! Bounded least-recently-used map from absolute embed path to the rendered
//! value and the footprint that render produced.
//!
//! - Owned by exactly one unit of work; never shared, so no locking
//! - Entries are inserted or evicted, never mutated in place
//! - Values are handed out as `Arc<Value>`: callers that want to modify a
//!   result copy-on-write it (`Arc::make_mut`), leaving the cached entry and
//!   every other holder untouched
//!
//! Recency is tracked with a logical clock in a `BTreeMap`, keeping
//! eviction order deterministic.

use crate::Footprint;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A cached embed result.
#[derive(Debug, Clone)]
pub struct EmbedEntry {
    /// The rendered value.
    pub value: Arc<Value>,
    /// What the render depended on.
    pub footprint: Footprint,
}

/// Counters reported when a unit of work ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries dropped to make room.
    pub evictions: u64,
}

#[derive(Debug)]
struct Slot {
    entry: EmbedEntry,
    stamp: u64,
}

/// Bounded LRU cache of embed results.
#[derive(Debug)]
pub struct EmbedCache {
    name: String,
    capacity: usize,
    slots: BTreeMap<String, Slot>,
    recency: BTreeMap<u64, String>,
    clock: u64,
    stats: CacheStats,
}

impl EmbedCache {
    /// Create a cache instance. A capacity of zero caches nothing.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            slots: BTreeMap::new(),
            recency: BTreeMap::new(),
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    /// Instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if the cache holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Hit/miss/eviction counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn tick(&mut self) -> u64 {
        self.clock = self.clock.saturating_add(1);
        self.clock
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&mut self, key: &str) -> Option<EmbedEntry> {
        let stamp = self.tick();
        let Some(slot) = self.slots.get_mut(key) else {
            self.stats.misses = self.stats.misses.saturating_add(1);
            return None;
        };
        self.recency.remove(&slot.stamp);
        slot.stamp = stamp;
        self.recency.insert(stamp, key.to_string());
        self.stats.hits = self.stats.hits.saturating_add(1);
        Some(slot.entry.clone())
    }

    /// Check for `key` without touching recency.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// Insert or replace `key`, evicting least recently used entries when full.
    pub fn insert(&mut self, key: impl Into<String>, entry: EmbedEntry) {
        if self.capacity == 0 {
            return;
        }
        let key = key.into();
        let stamp = self.tick();
        if let Some(old) = self.slots.remove(&key) {
            self.recency.remove(&old.stamp);
        }
        while self.slots.len() >= self.capacity {
            let Some((_, victim)) = self.recency.pop_first() else {
                break;
            };
            self.slots.remove(&victim);
            self.stats.evictions = self.stats.evictions.saturating_add(1);
            tracing::debug!(cache = %self.name, path = %victim, "evicted embed cache entry");
        }
        self.recency.insert(stamp, key.clone());
        self.slots.insert(key, Slot { entry, stamp });
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.recency.clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================
