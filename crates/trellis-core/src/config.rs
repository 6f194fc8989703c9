//! # Runtime Settings
//!
//! Deserializable settings for the read path. Every field has a default,
//! so an empty document is a valid configuration.

use crate::primitives::{DEFAULT_CACHE_CAPACITY, EMBED_CACHE, MAX_CALC_DEPTH, MAX_EMBED_DEPTH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Capacities of named cache instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Capacity used when a name has no explicit entry.
    pub default_capacity: usize,
    /// Per-instance capacities, keyed by cache name.
    pub capacities: BTreeMap<String, usize>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_CACHE_CAPACITY,
            capacities: BTreeMap::new(),
        }
    }
}

impl CacheSettings {
    /// Settings with a single explicit capacity for the embed cache.
    #[must_use]
    pub fn with_embed_capacity(capacity: usize) -> Self {
        let mut settings = Self::default();
        settings.capacities.insert(EMBED_CACHE.to_string(), capacity);
        settings
    }

    /// Capacity for the named instance.
    #[must_use]
    pub fn capacity_for(&self, name: &str) -> usize {
        self.capacities
            .get(name)
            .copied()
            .unwrap_or(self.default_capacity)
    }
}

/// Recursion bounds for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderLimits {
    /// Maximum nesting of embed sub-calls.
    pub max_embed_depth: usize,
    /// Maximum nesting of calculated-property evaluation per item.
    pub max_calc_depth: usize,
}

impl Default for RenderLimits {
    fn default() -> Self {
        Self {
            max_embed_depth: MAX_EMBED_DEPTH,
            max_calc_depth: MAX_CALC_DEPTH,
        }
    }
}
