//! # redb-backed Authoritative Store
//!
//! Every commit is one redb write transaction: the item record, its unique
//! key and reverse-link slots, and the tid counter change together or not
//! at all.

use super::codec::{
    self, ITEMS, KEYS, METADATA, REVERSE, StoredItem, decode, encode, io, slot_ids,
};
use super::{ItemStore, ItemWrite};
use crate::{Item, ItemId, PropertySheet, Tid, TrellisError, TypeName};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata};
use std::path::Path;

const TID_KEY: &str = "tid";
const NEXT_ID_KEY: &str = "next_id";

/// Authoritative Store persisted with redb.
pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TrellisError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let write_txn = db.begin_write().map_err(io)?;
        {
            let _ = write_txn.open_table(ITEMS).map_err(io)?;
            let _ = write_txn.open_table(KEYS).map_err(io)?;
            let _ = write_txn.open_table(REVERSE).map_err(io)?;
            let _ = write_txn.open_table(METADATA).map_err(io)?;
        }
        write_txn.commit().map_err(io)?;

        Ok(Self { db })
    }

    /// Number of stored items.
    pub fn len(&self) -> Result<u64, TrellisError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(ITEMS).map_err(io)?;
        table.len().map_err(io)
    }

    /// Check if the store holds nothing.
    pub fn is_empty(&self) -> Result<bool, TrellisError> {
        Ok(self.len()? == 0)
    }

    fn metadata(&self, key: &str) -> Result<u64, TrellisError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(METADATA).map_err(io)?;
        Ok(table.get(key).map_err(io)?.map(|v| v.value()).unwrap_or(0))
    }

    fn load(&self, ids: &[u64]) -> Result<Vec<Item>, TrellisError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(ITEMS).map_err(io)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(data) = table.get(*id).map_err(io)? {
                let stored: StoredItem = decode(data.value())?;
                out.push(stored.to_item()?);
            }
        }
        Ok(out)
    }
}

impl ItemStore for RedbStore {
    fn get_by_id(&self, id: ItemId) -> Result<Option<Item>, TrellisError> {
        Ok(self.load(&[id.0])?.pop())
    }

    fn get_by_unique_key(&self, key: &str, value: &str) -> Result<Vec<Item>, TrellisError> {
        let ids = {
            let read_txn = self.db.begin_read().map_err(io)?;
            let table = read_txn.open_table(KEYS).map_err(io)?;
            slot_ids(&table, &codec::key_slot(key, value))?
        };
        self.load(&ids)
    }

    fn get_reverse_links(
        &self,
        target: ItemId,
        source_types: &[TypeName],
        field: &str,
    ) -> Result<Vec<Item>, TrellisError> {
        let ids = {
            let read_txn = self.db.begin_read().map_err(io)?;
            let table = read_txn.open_table(REVERSE).map_err(io)?;
            slot_ids(&table, &codec::reverse_slot(target, field))?
        };
        Ok(self
            .load(&ids)?
            .into_iter()
            .filter(|item| source_types.contains(item.item_type()))
            .collect())
    }

    fn put(&mut self, write: ItemWrite) -> Result<Item, TrellisError> {
        let write_txn = self.db.begin_write().map_err(io)?;
        let item = {
            let mut items = write_txn.open_table(ITEMS).map_err(io)?;
            let mut keys = write_txn.open_table(KEYS).map_err(io)?;
            let mut reverse = write_txn.open_table(REVERSE).map_err(io)?;
            let mut meta = write_txn.open_table(METADATA).map_err(io)?;

            let tid = Tid(meta.get(TID_KEY).map_err(io)?.map(|v| v.value()).unwrap_or(0)).next();
            let next_id = meta.get(NEXT_ID_KEY).map_err(io)?.map(|v| v.value()).unwrap_or(1);

            let previous: Option<StoredItem> = match items.get(write.id.0).map_err(io)? {
                Some(data) => Some(decode(data.value())?),
                None => None,
            };
            if let Some(old) = &previous {
                for slot in old.key_slots() {
                    codec::edit_slot(&mut keys, &slot, old.id, false)?;
                }
                for slot in old.reverse_slots() {
                    codec::edit_slot(&mut reverse, &slot, old.id, false)?;
                }
            }

            let item = Item::new(
                write.id,
                write.item_type,
                PropertySheet::new(tid, write.properties),
            );
            let stored = StoredItem::new(&item, &write.keys, &write.links)?;
            for slot in stored.key_slots() {
                codec::edit_slot(&mut keys, &slot, stored.id, true)?;
            }
            for slot in stored.reverse_slots() {
                codec::edit_slot(&mut reverse, &slot, stored.id, true)?;
            }

            let bytes = encode(&stored)?;
            items.insert(stored.id, bytes.as_slice()).map_err(io)?;
            meta.insert(TID_KEY, tid.0).map_err(io)?;
            meta.insert(NEXT_ID_KEY, next_id.max(stored.id.saturating_add(1)))
                .map_err(io)?;
            item
        };
        write_txn.commit().map_err(io)?;
        Ok(item)
    }

    fn allocate_id(&mut self) -> Result<ItemId, TrellisError> {
        let write_txn = self.db.begin_write().map_err(io)?;
        let id = {
            let mut meta = write_txn.open_table(METADATA).map_err(io)?;
            let id = meta
                .get(NEXT_ID_KEY)
                .map_err(io)?
                .map(|v| v.value())
                .unwrap_or(1)
                .max(1);
            meta.insert(NEXT_ID_KEY, id.saturating_add(1)).map_err(io)?;
            id
        };
        write_txn.commit().map_err(io)?;
        Ok(ItemId(id))
    }

    fn current_tid(&self) -> Result<Tid, TrellisError> {
        Ok(Tid(self.metadata(TID_KEY)?))
    }

    fn item_ids(&self) -> Result<Vec<ItemId>, TrellisError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(ITEMS).map_err(io)?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (key, _) = entry.map_err(io)?;
            ids.push(ItemId(key.value()));
        }
        Ok(ids)
    }
}
