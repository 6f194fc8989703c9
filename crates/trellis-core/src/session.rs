//! # Session Module
//!
//! Sessions, their edit logs, and units of work.
//!
//! - A `Session` outlives requests and owns the Session Edit Log: one entry
//!   per write the session itself committed
//! - A `UnitOfWork` is one request. It owns the embed cache, the evaluation
//!   contexts and a view of the edit log. Nothing it owns is shared with
//!   another unit of work
//! - Ending a unit of work (success or failure) drops its cache and
//!   contexts; the entries it committed are merged back into the session,
//!   so units of work that overlap never drop each other's writes
//!
//! ## Read Tiers
//!
//! Reads prefer the secondary index (`ReadTier::Indexed`). A unit of work
//! that is about to write, or renders an edit view, switches to
//! `ReadTier::Authoritative`.

use crate::cache::{CacheStats, EmbedCache};
use crate::config::{CacheSettings, RenderLimits};
use crate::context::EvalContext;
use crate::primitives::EMBED_CACHE;
use crate::{Footprint, ItemId, Tid, TrellisError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// SESSION EDIT LOG
// =============================================================================

/// One committed write of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditLogEntry {
    /// Tid the write committed at.
    pub tid: Tid,
    /// Items whose content changed.
    pub changed: BTreeSet<ItemId>,
    /// Items whose linking renders changed.
    pub linked_changed: BTreeSet<ItemId>,
}

impl EditLogEntry {
    /// Create an entry.
    pub fn new(
        tid: Tid,
        changed: impl IntoIterator<Item = ItemId>,
        linked_changed: impl IntoIterator<Item = ItemId>,
    ) -> Self {
        Self {
            tid,
            changed: changed.into_iter().collect(),
            linked_changed: linked_changed.into_iter().collect(),
        }
    }
}

/// The session's own writes, used only to detect stale index records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEditLog {
    entries: Vec<EditLogEntry>,
}

impl SessionEditLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a committed write.
    pub fn record(&mut self, entry: EditLogEntry) {
        self.entries.push(entry);
    }

    /// Merge entries committed by a unit of work, keeping tid order.
    ///
    /// An entry already in the log is skipped, so merging is idempotent.
    pub fn merge(&mut self, entries: impl IntoIterator<Item = EditLogEntry>) {
        for entry in entries {
            if self.entries.contains(&entry) {
                continue;
            }
            let at = self.entries.partition_point(|e| e.tid <= entry.tid);
            self.entries.insert(at, entry);
        }
    }

    /// All entries in tid order.
    #[must_use]
    pub fn entries(&self) -> &[EditLogEntry] {
        &self.entries
    }

    /// Check if the session has written nothing (that still matters).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Tid of the newest entry.
    #[must_use]
    pub fn latest_tid(&self) -> Option<Tid> {
        self.entries.iter().map(|e| e.tid).max()
    }

    /// Decide whether an index record built at `indexed_tid` with
    /// `footprint` may be older than something this session wrote.
    ///
    /// Entries before `indexed_tid` are already reflected in the record.
    /// Of the rest, a changed id inside the embedded set, or a
    /// linked-changed id inside the linked set, makes the record stale.
    #[must_use]
    pub fn invalidates(&self, indexed_tid: Tid, footprint: &Footprint) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        self.entries
            .iter()
            .filter(|e| e.tid >= indexed_tid)
            .any(|e| {
                !e.changed.is_disjoint(&footprint.embedded)
                    || !e.linked_changed.is_disjoint(&footprint.linked)
            })
    }

    /// Drop entries at or below `tid`. Returns how many were dropped.
    ///
    /// Once the index has caught up through `tid`, those entries can no
    /// longer make a record stale.
    pub fn prune_through(&mut self, tid: Tid) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.tid > tid);
        before - self.entries.len()
    }
}

// =============================================================================
// UNIT OF WORK
// =============================================================================

/// Which storage tier reads go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadTier {
    /// Secondary index, with staleness checks against the edit log.
    #[default]
    Indexed,
    /// Authoritative store only.
    Authoritative,
}

/// One request's worth of state.
///
/// Built by `Session::unit_of_work`; the embed cache is created on first use.
#[derive(Debug)]
pub struct UnitOfWork {
    tier: ReadTier,
    edits: SessionEditLog,
    committed: Vec<EditLogEntry>,
    cache_settings: CacheSettings,
    limits: RenderLimits,
    cache: Option<EmbedCache>,
    pub(crate) contexts: BTreeMap<ItemId, EvalContext>,
    pub(crate) footprints: Vec<Footprint>,
    pub(crate) in_flight: Vec<String>,
}

impl UnitOfWork {
    /// Create a unit of work over a view of the session's edit log.
    #[must_use]
    pub fn new(edits: SessionEditLog, cache_settings: CacheSettings, limits: RenderLimits) -> Self {
        Self {
            tier: ReadTier::Indexed,
            edits,
            committed: Vec::new(),
            cache_settings,
            limits,
            cache: None,
            contexts: BTreeMap::new(),
            footprints: vec![Footprint::new()],
            in_flight: Vec::new(),
        }
    }

    /// Choose the read tier up front.
    #[must_use]
    pub fn with_tier(mut self, tier: ReadTier) -> Self {
        self.tier = tier;
        self
    }

    /// Send every further read to the authoritative store.
    ///
    /// Contexts built from index reads are dropped so nothing rendered
    /// afterwards mixes tiers.
    pub fn require_authoritative(&mut self) {
        if self.tier != ReadTier::Authoritative {
            self.tier = ReadTier::Authoritative;
            self.contexts.clear();
            if let Some(cache) = self.cache.as_mut() {
                cache.clear();
            }
        }
    }

    /// Current read tier.
    #[must_use]
    pub fn tier(&self) -> ReadTier {
        self.tier
    }

    /// The edit log view.
    #[must_use]
    pub fn edits(&self) -> &SessionEditLog {
        &self.edits
    }

    /// Recursion bounds.
    #[must_use]
    pub fn limits(&self) -> RenderLimits {
        self.limits
    }

    /// The embed cache, created on first use.
    pub fn embed_cache(&mut self) -> &mut EmbedCache {
        let capacity = self.cache_settings.capacity_for(EMBED_CACHE);
        self.cache
            .get_or_insert_with(|| EmbedCache::new(EMBED_CACHE, capacity))
    }

    /// Embed cache counters, if the cache was ever used.
    #[must_use]
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(EmbedCache::stats)
    }

    /// Everything the unit of work has rendered so far depended on.
    #[must_use]
    pub fn footprint(&self) -> Footprint {
        let mut total = Footprint::new();
        for fp in &self.footprints {
            total.merge(fp);
        }
        total
    }

    /// Append a committed write to the edit log.
    ///
    /// Contexts of touched items and the whole embed cache are dropped:
    /// anything computed before the write may embed the old content.
    pub fn record_edit(&mut self, entry: EditLogEntry) {
        for id in entry.changed.iter().chain(entry.linked_changed.iter()) {
            self.contexts.remove(id);
        }
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
        self.committed.push(entry.clone());
        self.edits.record(entry);
    }

    /// Fold a finished sub-render's footprint into the enclosing one.
    pub(crate) fn absorb(&mut self, footprint: &Footprint) {
        if let Some(top) = self.footprints.last_mut() {
            top.merge(footprint);
        }
    }

    /// End the unit of work, keeping only the entries it committed.
    #[must_use]
    pub fn finish(self) -> Vec<EditLogEntry> {
        if let Some(stats) = self.cache_stats() {
            tracing::debug!(
                hits = stats.hits,
                misses = stats.misses,
                evictions = stats.evictions,
                contexts = self.contexts.len(),
                "unit of work finished"
            );
        }
        self.committed
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// A client session: settings plus the edit log that survives requests.
#[derive(Debug, Clone, Default)]
pub struct Session {
    edits: SessionEditLog,
    cache_settings: CacheSettings,
    limits: RenderLimits,
}

impl Session {
    /// Create a session with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session with explicit cache and render settings.
    #[must_use]
    pub fn with_settings(cache_settings: CacheSettings, limits: RenderLimits) -> Self {
        Self {
            edits: SessionEditLog::new(),
            cache_settings,
            limits,
        }
    }

    /// The session's edit log.
    #[must_use]
    pub fn edits(&self) -> &SessionEditLog {
        &self.edits
    }

    /// Open a fresh unit of work.
    #[must_use]
    pub fn unit_of_work(&self) -> UnitOfWork {
        UnitOfWork::new(self.edits.clone(), self.cache_settings.clone(), self.limits)
    }

    /// Close a unit of work and merge its committed edits into the log.
    pub fn complete(&mut self, uow: UnitOfWork) {
        self.edits.merge(uow.finish());
    }

    /// Run `work` in a fresh unit of work, retrying on write conflicts.
    ///
    /// Each attempt gets its own cache and contexts; edits committed by a
    /// failed attempt stay in the log because the store kept them.
    pub fn run<T, F>(&mut self, max_attempts: usize, mut work: F) -> Result<T, TrellisError>
    where
        F: FnMut(&mut UnitOfWork) -> Result<T, TrellisError>,
    {
        let attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let mut uow = self.unit_of_work();
            let outcome = work(&mut uow);
            self.complete(uow);
            match outcome {
                Err(TrellisError::Conflict { id, .. }) if attempt < attempts => {
                    tracing::warn!(item = %id, attempt, "write conflict, retrying unit of work");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Forget entries the secondary index has caught up with.
    pub fn prune_edits(&mut self, indexed_through: Tid) -> usize {
        self.edits.prune_through(indexed_through)
    }
}

// =============================================================================
// TESTS
// =============================================================================
