//! # In-Memory Tiers
//!
//! `MemoryStore` and `MemoryIndex` keep everything in `BTreeMap`s.
//! Used by tests and by one-shot tools that do not need persistence.

use super::{IndexStore, IndexedRecord, ItemStore, ItemWrite};
use crate::{Item, ItemId, PropertySheet, Tid, TrellisError, TypeName};
use std::collections::{BTreeMap, BTreeSet};

/// Unique-key and reverse-link tables shared by both in-memory tiers.
#[derive(Debug, Clone, Default)]
struct LookupTables {
    keys: BTreeMap<(String, String), BTreeSet<ItemId>>,
    reverse: BTreeMap<(ItemId, String), BTreeSet<ItemId>>,
    owned: BTreeMap<ItemId, (Vec<(String, String)>, Vec<(String, ItemId)>)>,
}

impl LookupTables {
    /// Replace the entries owned by `id`.
    fn replace(&mut self, id: ItemId, keys: &[(String, String)], links: &[(String, ItemId)]) {
        if let Some((old_keys, old_links)) = self.owned.remove(&id) {
            for key in old_keys {
                if let Some(ids) = self.keys.get_mut(&key) {
                    ids.remove(&id);
                }
            }
            for (field, target) in old_links {
                if let Some(ids) = self.reverse.get_mut(&(target, field)) {
                    ids.remove(&id);
                }
            }
        }
        for key in keys {
            self.keys.entry(key.clone()).or_default().insert(id);
        }
        for (field, target) in links {
            self.reverse
                .entry((*target, field.clone()))
                .or_default()
                .insert(id);
        }
        self.owned.insert(id, (keys.to_vec(), links.to_vec()));
    }

    fn key_hits(&self, key: &str, value: &str) -> Vec<ItemId> {
        self.keys
            .get(&(key.to_string(), value.to_string()))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn sources(&self, target: ItemId, field: &str) -> Vec<ItemId> {
        self.reverse
            .get(&(target, field.to_string()))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }
}

// =============================================================================
// AUTHORITATIVE STORE
// =============================================================================

/// In-memory Authoritative Store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    items: BTreeMap<ItemId, Item>,
    tables: LookupTables,
    tid: Tid,
    next_id: u64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Number of stored items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the store holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl ItemStore for MemoryStore {
    fn get_by_id(&self, id: ItemId) -> Result<Option<Item>, TrellisError> {
        Ok(self.items.get(&id).cloned())
    }

    fn get_by_unique_key(&self, key: &str, value: &str) -> Result<Vec<Item>, TrellisError> {
        Ok(self
            .tables
            .key_hits(key, value)
            .into_iter()
            .filter_map(|id| self.items.get(&id).cloned())
            .collect())
    }

    fn get_reverse_links(
        &self,
        target: ItemId,
        source_types: &[TypeName],
        field: &str,
    ) -> Result<Vec<Item>, TrellisError> {
        Ok(self
            .tables
            .sources(target, field)
            .into_iter()
            .filter_map(|id| self.items.get(&id))
            .filter(|item| source_types.contains(item.item_type()))
            .cloned()
            .collect())
    }

    fn put(&mut self, write: ItemWrite) -> Result<Item, TrellisError> {
        let tid = self.tid.next();
        let item = Item::new(
            write.id,
            write.item_type,
            PropertySheet::new(tid, write.properties),
        );
        self.tables.replace(write.id, &write.keys, &write.links);
        self.items.insert(write.id, item.clone());
        self.tid = tid;
        self.next_id = self.next_id.max(write.id.0.saturating_add(1));
        Ok(item)
    }

    fn allocate_id(&mut self) -> Result<ItemId, TrellisError> {
        let id = ItemId(self.next_id.max(1));
        self.next_id = id.0.saturating_add(1);
        Ok(id)
    }

    fn current_tid(&self) -> Result<Tid, TrellisError> {
        Ok(self.tid)
    }

    fn item_ids(&self) -> Result<Vec<ItemId>, TrellisError> {
        Ok(self.items.keys().copied().collect())
    }
}

// =============================================================================
// SECONDARY INDEX
// =============================================================================

/// In-memory Secondary Index.
#[derive(Debug, Clone, Default)]
pub struct MemoryIndex {
    records: BTreeMap<ItemId, IndexedRecord>,
    tables: LookupTables,
    indexed_through: Tid,
}

impl MemoryIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexStore for MemoryIndex {
    fn get_by_id(&self, id: ItemId) -> Result<Option<IndexedRecord>, TrellisError> {
        Ok(self.records.get(&id).cloned())
    }

    fn get_by_unique_key(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<IndexedRecord>, TrellisError> {
        Ok(self
            .tables
            .key_hits(key, value)
            .into_iter()
            .filter_map(|id| self.records.get(&id).cloned())
            .collect())
    }

    fn get_reverse_links(
        &self,
        target: ItemId,
        source_types: &[TypeName],
        field: &str,
    ) -> Result<Vec<IndexedRecord>, TrellisError> {
        Ok(self
            .tables
            .sources(target, field)
            .into_iter()
            .filter_map(|id| self.records.get(&id))
            .filter(|rec| source_types.contains(rec.item.item_type()))
            .cloned()
            .collect())
    }

    fn put(&mut self, record: IndexedRecord) -> Result<(), TrellisError> {
        let id = record.item.id();
        self.tables.replace(id, &record.keys, &record.links);
        self.records.insert(id, record);
        Ok(())
    }

    fn indexed_through(&self) -> Result<Tid, TrellisError> {
        Ok(self.indexed_through)
    }

    fn mark_indexed_through(&mut self, tid: Tid) -> Result<(), TrellisError> {
        self.indexed_through = self.indexed_through.max(tid);
        Ok(())
    }

    fn record_count(&self) -> Result<usize, TrellisError> {
        Ok(self.records.len())
    }
}
