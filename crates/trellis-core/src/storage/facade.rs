//! # Dual-Tier Storage Facade
//!
//! Chooses, per read, between the Secondary Index and the Authoritative
//! Store. Writes always go to the Authoritative Store.
//!
//! ## Read Selection
//!
//! - `ReadTier::Authoritative`: the store, always
//! - `ReadTier::Indexed`: the index, unless the record may predate one of
//!   the session's own writes (see `SessionEditLog::invalidates`), in which
//!   case the store is read instead
//!
//! Index misses and index errors also fall back to the store; errors are
//! logged, never swallowed silently.
//!
//! ## Unique Keys
//!
//! Zero or several matches are `None`: ambiguity is never resolved by
//! picking one.

use super::{IndexStore, IndexedRecord, ItemStore, ItemWrite};
use crate::schema::Schema;
use crate::session::{EditLogEntry, ReadTier, SessionEditLog, UnitOfWork};
use crate::{Item, ItemId, Properties, Tid, TrellisError, TypeName};
use std::collections::BTreeSet;

/// Input of `StorageFacade::create`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    /// Explicit identifier, or `None` to allocate one.
    pub id: Option<ItemId>,
    /// Most specific type.
    pub item_type: TypeName,
    /// Stored properties; links as JSON integers.
    pub properties: Properties,
}

impl NewItem {
    /// A new item with an allocated identifier.
    #[must_use]
    pub fn new(item_type: impl Into<String>, properties: Properties) -> Self {
        Self {
            id: None,
            item_type: TypeName::new(item_type),
            properties,
        }
    }

    /// Use a fixed identifier.
    #[must_use]
    pub fn with_id(mut self, id: ItemId) -> Self {
        self.id = Some(id);
        self
    }
}

/// The two tiers behind one read/write surface.
pub struct StorageFacade {
    store: Box<dyn ItemStore + Send>,
    index: Box<dyn IndexStore + Send>,
}

impl std::fmt::Debug for StorageFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageFacade").finish_non_exhaustive()
    }
}

impl StorageFacade {
    /// Pair an Authoritative Store with a Secondary Index.
    pub fn new(
        store: impl ItemStore + Send + 'static,
        index: impl IndexStore + Send + 'static,
    ) -> Self {
        Self {
            store: Box::new(store),
            index: Box::new(index),
        }
    }

    /// The Authoritative Store.
    #[must_use]
    pub fn authoritative(&self) -> &dyn ItemStore {
        self.store.as_ref()
    }

    /// The Secondary Index.
    #[must_use]
    pub fn index(&self) -> &dyn IndexStore {
        self.index.as_ref()
    }

    /// The Secondary Index, for index maintenance.
    pub fn index_mut(&mut self) -> &mut dyn IndexStore {
        self.index.as_mut()
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Point lookup.
    pub fn get_by_id(
        &self,
        edits: &SessionEditLog,
        tier: ReadTier,
        id: ItemId,
    ) -> Result<Option<Item>, TrellisError> {
        if tier == ReadTier::Indexed {
            match self.index.get_by_id(id) {
                Ok(Some(record)) => {
                    if let Some(item) = fresh(edits, record) {
                        return Ok(Some(item));
                    }
                }
                Ok(None) => {
                    tracing::debug!(item = %id, "index miss, reading authoritative store");
                }
                Err(e) => {
                    tracing::warn!(item = %id, error = %e, "index read failed, reading authoritative store");
                }
            }
        }
        self.store.get_by_id(id)
    }

    /// Unique key lookup. `None` unless exactly one item matches.
    pub fn get_by_unique_key(
        &self,
        edits: &SessionEditLog,
        tier: ReadTier,
        key: &str,
        value: &str,
    ) -> Result<Option<Item>, TrellisError> {
        if tier == ReadTier::Indexed {
            match self.index.get_by_unique_key(key, value) {
                Ok(mut records) if records.len() == 1 => {
                    if let Some(item) = records.pop().and_then(|r| fresh(edits, r)) {
                        return Ok(Some(item));
                    }
                }
                Ok(records) => {
                    tracing::debug!(
                        key,
                        value,
                        matches = records.len(),
                        "no unique index match, reading authoritative store"
                    );
                }
                Err(e) => {
                    tracing::warn!(key, value, error = %e, "index read failed, reading authoritative store");
                }
            }
        }
        let mut items = self.store.get_by_unique_key(key, value)?;
        if items.len() > 1 {
            tracing::warn!(key, value, matches = items.len(), "ambiguous unique key");
        }
        Ok(if items.len() == 1 { items.pop() } else { None })
    }

    /// Items of any of `source_types` whose `field` links to `target`.
    ///
    /// A scan result has no single tid to check, so the index only answers
    /// while the session has written nothing.
    pub fn get_reverse_links(
        &self,
        edits: &SessionEditLog,
        tier: ReadTier,
        target: ItemId,
        source_types: &[TypeName],
        field: &str,
    ) -> Result<Vec<Item>, TrellisError> {
        if tier == ReadTier::Indexed && edits.is_empty() {
            match self.index.get_reverse_links(target, source_types, field) {
                Ok(records) => return Ok(records.into_iter().map(|r| r.item).collect()),
                Err(e) => {
                    tracing::warn!(item = %target, field, error = %e, "index scan failed, reading authoritative store");
                }
            }
        }
        self.store.get_reverse_links(target, source_types, field)
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Create an item and log the write in the unit of work.
    pub fn create(
        &mut self,
        schema: &Schema,
        uow: &mut UnitOfWork,
        new: NewItem,
    ) -> Result<Item, TrellisError> {
        schema.type_info(&new.item_type)?;
        uow.require_authoritative();

        let id = match new.id {
            Some(id) => id,
            None => self.store.allocate_id()?,
        };
        if let Some(existing) = self.store.get_by_id(id)? {
            return Err(TrellisError::Conflict {
                id,
                expected: Tid::ZERO,
                actual: existing.tid(),
            });
        }
        self.commit(schema, uow, id, new.item_type, new.properties, &[])
    }

    /// Replace the properties of an existing item.
    ///
    /// With `expected_tid`, the write only succeeds if the stored version
    /// is still the one the caller read.
    pub fn update(
        &mut self,
        schema: &Schema,
        uow: &mut UnitOfWork,
        id: ItemId,
        properties: Properties,
        expected_tid: Option<Tid>,
    ) -> Result<Item, TrellisError> {
        uow.require_authoritative();
        let current = self
            .store
            .get_by_id(id)?
            .ok_or_else(|| TrellisError::NotFound(id.to_string()))?;
        if let Some(expected) = expected_tid
            && expected != current.tid()
        {
            return Err(TrellisError::Conflict {
                id,
                expected,
                actual: current.tid(),
            });
        }
        let old_links = schema.links(current.item_type(), current.sheet().properties());
        self.commit(
            schema,
            uow,
            id,
            current.item_type().clone(),
            properties,
            &old_links,
        )
    }

    fn commit(
        &mut self,
        schema: &Schema,
        uow: &mut UnitOfWork,
        id: ItemId,
        item_type: TypeName,
        properties: Properties,
        old_links: &[(String, ItemId)],
    ) -> Result<Item, TrellisError> {
        let keys = schema.unique_key_values(&item_type, &properties);
        for (key, value) in &keys {
            let taken = self
                .store
                .get_by_unique_key(key, value)?
                .iter()
                .any(|other| other.id() != id);
            if taken {
                return Err(TrellisError::UniqueKeyConflict {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        let links = schema.links(&item_type, &properties);

        // Targets on both sides gain or lose a reverse-link entry.
        let mut changed: BTreeSet<ItemId> = BTreeSet::from([id]);
        changed.extend(old_links.iter().chain(links.iter()).map(|(_, target)| *target));

        let item = self.store.put(ItemWrite {
            id,
            item_type,
            properties,
            keys,
            links,
        })?;
        tracing::debug!(item = %id, tid = %item.tid(), changed = changed.len(), "committed write");
        uow.record_edit(EditLogEntry::new(item.tid(), changed, [id]));
        Ok(item)
    }
}

/// The record's item, unless the session's edits make it stale.
fn fresh(edits: &SessionEditLog, record: IndexedRecord) -> Option<Item> {
    if edits.invalidates(record.indexed_tid, &record.footprint) {
        tracing::debug!(
            item = %record.item.id(),
            indexed_tid = %record.indexed_tid,
            "index record invalidated by session edits"
        );
        return None;
    }
    Some(record.item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TypeInfo;
    use crate::session::Session;
    use crate::storage::{MemoryIndex, MemoryStore};
    use crate::{Footprint, PropertySheet};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(vec![
            TypeInfo::new("Organism", "organisms").unique_key("name"),
            TypeInfo::new("Gene", "genes")
                .unique_key("symbol")
                .link("organism", "Organism"),
        ])
        .expect("schema")
    }

    fn props(pairs: &[(&str, serde_json::Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn indexed(item: &Item, footprint: Footprint, keys: Vec<(String, String)>) -> IndexedRecord {
        IndexedRecord {
            item: item.clone(),
            indexed_tid: item.tid(),
            footprint,
            keys,
            links: Vec::new(),
        }
    }

    #[test]
    fn write_logs_changed_targets() {
        let schema = schema();
        let mut facade = StorageFacade::new(MemoryStore::new(), MemoryIndex::new());
        let mut uow = Session::new().unit_of_work();

        let org = facade
            .create(&schema, &mut uow, NewItem::new("Organism", props(&[("name", json!("human"))])))
            .expect("create");
        let gene = facade
            .create(
                &schema,
                &mut uow,
                NewItem::new("Gene", props(&[("symbol", json!("ATF4")), ("organism", json!(org.id().0))])),
            )
            .expect("create");

        let last = uow.edits().entries().last().expect("entry");
        assert_eq!(last.tid, gene.tid());
        assert!(last.changed.contains(&gene.id()));
        assert!(last.changed.contains(&org.id()));
        assert_eq!(last.linked_changed, BTreeSet::from([gene.id()]));
        assert_eq!(uow.tier(), ReadTier::Authoritative);
    }

    #[test]
    fn unique_key_conflict_rejected() {
        let schema = schema();
        let mut facade = StorageFacade::new(MemoryStore::new(), MemoryIndex::new());
        let mut uow = Session::new().unit_of_work();
        let human = props(&[("name", json!("human"))]);
        facade
            .create(&schema, &mut uow, NewItem::new("Organism", human.clone()))
            .expect("create");
        let result = facade.create(&schema, &mut uow, NewItem::new("Organism", human));
        assert!(matches!(result, Err(TrellisError::UniqueKeyConflict { .. })));
    }

    #[test]
    fn stale_expected_tid_conflicts() {
        let schema = schema();
        let mut facade = StorageFacade::new(MemoryStore::new(), MemoryIndex::new());
        let mut uow = Session::new().unit_of_work();
        let org = facade
            .create(&schema, &mut uow, NewItem::new("Organism", props(&[("name", json!("a"))])))
            .expect("create");
        facade
            .update(&schema, &mut uow, org.id(), props(&[("name", json!("b"))]), Some(org.tid()))
            .expect("update");
        let result = facade.update(
            &schema,
            &mut uow,
            org.id(),
            props(&[("name", json!("c"))]),
            Some(org.tid()),
        );
        assert!(matches!(result, Err(TrellisError::Conflict { .. })));
    }

    #[test]
    fn ambiguous_unique_key_is_none() {
        let mut store = MemoryStore::new();
        for id in [1, 2] {
            store
                .put(ItemWrite {
                    id: ItemId(id),
                    item_type: TypeName::new("Organism"),
                    properties: Properties::new(),
                    keys: vec![("organism:name".to_string(), "dup".to_string())],
                    links: Vec::new(),
                })
                .expect("put");
        }
        let facade = StorageFacade::new(store, MemoryIndex::new());
        let edits = SessionEditLog::new();
        for tier in [ReadTier::Indexed, ReadTier::Authoritative] {
            let hit = facade
                .get_by_unique_key(&edits, tier, "organism:name", "dup")
                .expect("lookup");
            assert!(hit.is_none());
        }
    }

    #[test]
    fn fresh_index_record_served_with_empty_log() {
        let item = Item::new(
            ItemId(1),
            TypeName::new("Organism"),
            PropertySheet::new(Tid(1), props(&[("name", json!("indexed"))])),
        );
        let mut index = MemoryIndex::new();
        index
            .put(indexed(
                &item,
                Footprint::new(),
                vec![("organism:name".to_string(), "indexed".to_string())],
            ))
            .expect("put");
        let facade = StorageFacade::new(MemoryStore::new(), index);
        let edits = SessionEditLog::new();

        assert_eq!(
            facade.get_by_id(&edits, ReadTier::Indexed, ItemId(1)).expect("get"),
            Some(item.clone())
        );
        assert_eq!(
            facade
                .get_by_unique_key(&edits, ReadTier::Indexed, "organism:name", "indexed")
                .expect("get"),
            Some(item)
        );
        assert_eq!(
            facade.get_by_id(&edits, ReadTier::Authoritative, ItemId(1)).expect("get"),
            None
        );
    }
}
