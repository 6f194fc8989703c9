//! # Evaluation Context
//!
//! One context exists per (item, unit of work). It memoizes every attribute
//! resolved for the item together with the footprint that resolution
//! produced, so a repeated lookup neither recomputes nor loses dependency
//! information.
//!
//! Caller-supplied overrides live on the context and shadow every other
//! source for that evaluation only; the registry is never touched.

use crate::{Footprint, Item, Resolved};
use serde_json::Value;
use std::collections::BTreeMap;

/// A memoized resolution.
#[derive(Debug, Clone)]
pub(crate) struct Memo {
    pub(crate) resolved: Resolved,
    pub(crate) footprint: Footprint,
}

/// Per-item memo of resolved attributes.
#[derive(Debug, Clone)]
pub struct EvalContext {
    item: Item,
    path: String,
    memo: BTreeMap<String, Memo>,
    overrides: BTreeMap<String, Value>,
    resolving: Vec<String>,
}

impl EvalContext {
    /// Create an empty context for `item`, addressed as `path`.
    #[must_use]
    pub fn new(item: Item, path: impl Into<String>) -> Self {
        Self {
            item,
            path: path.into(),
            memo: BTreeMap::new(),
            overrides: BTreeMap::new(),
            resolving: Vec::new(),
        }
    }

    /// Shadow `name` with a fixed value for this context only.
    #[must_use]
    pub fn with_override(mut self, name: impl Into<String>, value: Value) -> Self {
        self.overrides.insert(name.into(), value);
        self
    }

    /// The item being evaluated.
    #[must_use]
    pub fn item(&self) -> &Item {
        &self.item
    }

    /// Canonical path of the item.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of memoized attributes.
    #[must_use]
    pub fn memoized(&self) -> usize {
        self.memo.len()
    }

    pub(crate) fn override_for(&self, name: &str) -> Option<&Value> {
        self.overrides.get(name)
    }

    pub(crate) fn memo_for(&self, name: &str) -> Option<&Memo> {
        self.memo.get(name)
    }

    pub(crate) fn remember(&mut self, name: &str, resolved: Resolved, footprint: Footprint) {
        self.memo
            .insert(name.to_string(), Memo { resolved, footprint });
    }

    /// Mark `name` as being resolved. Returns false if it already is.
    pub(crate) fn enter(&mut self, name: &str) -> bool {
        if self.resolving.iter().any(|n| n == name) {
            return false;
        }
        self.resolving.push(name.to_string());
        true
    }

    pub(crate) fn leave(&mut self) {
        self.resolving.pop();
    }

    pub(crate) fn depth(&self) -> usize {
        self.resolving.len()
    }
}
