//! # Storage
//!
//! The two storage tiers and the facade that chooses between them.
//!
//! - `ItemStore`: the Authoritative Store. Immediately consistent,
//!   append-only versioned writes, the only write target
//! - `IndexStore`: the Secondary Index. Possibly stale; every record carries
//!   the tid it was indexed at and the footprint of its embedded render
//! - `StorageFacade`: per-read tier selection plus staleness detection
//!   against the session's edit log
//!
//! Both tiers come in an in-memory flavour (tests, one-shot tools) and a
//! redb-backed flavour (the CLI).

pub mod codec;
pub mod facade;
pub mod memory;
pub mod redb_index;
pub mod redb_store;

use crate::{Footprint, Item, ItemId, Properties, Tid, TrellisError, TypeName};

pub use facade::{NewItem, StorageFacade};
pub use memory::{MemoryIndex, MemoryStore};
pub use redb_index::RedbIndex;
pub use redb_store::RedbStore;

// =============================================================================
// RECORDS
// =============================================================================

/// A new item version handed to the Authoritative Store.
///
/// Keys and links are extracted by the caller from the schema so the store
/// can maintain its lookup tables without knowing the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemWrite {
    /// Item being written.
    pub id: ItemId,
    /// Most specific type.
    pub item_type: TypeName,
    /// Full property bag of the new version.
    pub properties: Properties,
    /// Unique key `(namespace, value)` pairs.
    pub keys: Vec<(String, String)>,
    /// Forward links as `(field, target)` pairs.
    pub links: Vec<(String, ItemId)>,
}

/// One Secondary Index record.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedRecord {
    /// The item as it was when indexed.
    pub item: Item,
    /// Tid the record was (re)indexed at.
    pub indexed_tid: Tid,
    /// Footprint of the item's embedded render at `indexed_tid`.
    pub footprint: Footprint,
    /// Unique key `(namespace, value)` pairs.
    pub keys: Vec<(String, String)>,
    /// Forward links as `(field, target)` pairs.
    pub links: Vec<(String, ItemId)>,
}

// =============================================================================
// STORE TRAITS
// =============================================================================

/// The Authoritative Store.
///
/// Writes are serialized by the store; each commit gets the next tid.
pub trait ItemStore {
    /// Point lookup.
    fn get_by_id(&self, id: ItemId) -> Result<Option<Item>, TrellisError>;

    /// Every item carrying `value` under unique key namespace `key`.
    ///
    /// More than one hit means the data is ambiguous; the facade decides
    /// what that means.
    fn get_by_unique_key(&self, key: &str, value: &str) -> Result<Vec<Item>, TrellisError>;

    /// Items of any of `source_types` whose `field` links to `target`, in id order.
    fn get_reverse_links(
        &self,
        target: ItemId,
        source_types: &[TypeName],
        field: &str,
    ) -> Result<Vec<Item>, TrellisError>;

    /// Append a new version. Returns the committed item.
    fn put(&mut self, write: ItemWrite) -> Result<Item, TrellisError>;

    /// Reserve a fresh identifier.
    fn allocate_id(&mut self) -> Result<ItemId, TrellisError>;

    /// Tid of the last commit.
    fn current_tid(&self) -> Result<Tid, TrellisError>;

    /// Every stored identifier, in order.
    fn item_ids(&self) -> Result<Vec<ItemId>, TrellisError>;
}

/// The Secondary Index.
///
/// Never a source of truth: the facade only trusts a record after checking
/// it against the session's edit log.
pub trait IndexStore {
    /// Point lookup.
    fn get_by_id(&self, id: ItemId) -> Result<Option<IndexedRecord>, TrellisError>;

    /// Every record carrying `value` under unique key namespace `key`.
    fn get_by_unique_key(&self, key: &str, value: &str)
    -> Result<Vec<IndexedRecord>, TrellisError>;

    /// Records of any of `source_types` whose `field` links to `target`, in id order.
    fn get_reverse_links(
        &self,
        target: ItemId,
        source_types: &[TypeName],
        field: &str,
    ) -> Result<Vec<IndexedRecord>, TrellisError>;

    /// Insert or replace the record of `record.item`.
    fn put(&mut self, record: IndexedRecord) -> Result<(), TrellisError>;

    /// Tid through which every commit is reflected in the index.
    fn indexed_through(&self) -> Result<Tid, TrellisError>;

    /// Record that the index has caught up through `tid`.
    fn mark_indexed_through(&mut self, tid: Tid) -> Result<(), TrellisError>;

    /// Number of records.
    fn record_count(&self) -> Result<usize, TrellisError>;
}
