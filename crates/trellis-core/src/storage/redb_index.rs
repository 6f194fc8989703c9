//! # redb-backed Secondary Index
//!
//! Same table layout as the Authoritative Store, but each item record
//! carries its indexing tid and footprint. The `indexed_through`
//! watermark lives in the metadata table.

use super::codec::{
    self, ITEMS, KEYS, METADATA, REVERSE, StoredRecord, decode, encode, io, slot_ids,
};
use super::{IndexStore, IndexedRecord};
use crate::{ItemId, Tid, TrellisError, TypeName};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;

const WATERMARK_KEY: &str = "indexed_through";

/// Secondary Index persisted with redb.
pub struct RedbIndex {
    db: Database,
}

impl std::fmt::Debug for RedbIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbIndex").finish_non_exhaustive()
    }
}

impl RedbIndex {
    /// Open or create an index at the given path.
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

    fn load(&self, ids: &[u64]) -> Result<Vec<IndexedRecord>, TrellisError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(ITEMS).map_err(io)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(data) = table.get(*id).map_err(io)? {
                let stored: StoredRecord = decode(data.value())?;
                out.push(stored.to_record()?);
            }
        }
        Ok(out)
    }

    fn slot(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
        slot: &str,
    ) -> Result<Vec<u64>, TrellisError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(table).map_err(io)?;
        slot_ids(&table, slot)
    }
}

impl IndexStore for RedbIndex {
    fn get_by_id(&self, id: ItemId) -> Result<Option<IndexedRecord>, TrellisError> {
        Ok(self.load(&[id.0])?.pop())
    }

    fn get_by_unique_key(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<IndexedRecord>, TrellisError> {
        let ids = self.slot(KEYS, &codec::key_slot(key, value))?;
        self.load(&ids)
    }

    fn get_reverse_links(
        &self,
        target: ItemId,
        source_types: &[TypeName],
        field: &str,
    ) -> Result<Vec<IndexedRecord>, TrellisError> {
        let ids = self.slot(REVERSE, &codec::reverse_slot(target, field))?;
        Ok(self
            .load(&ids)?
            .into_iter()
            .filter(|rec| source_types.contains(rec.item.item_type()))
            .collect())
    }

    fn put(&mut self, record: IndexedRecord) -> Result<(), TrellisError> {
        let stored = StoredRecord::new(&record)?;
        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut items = write_txn.open_table(ITEMS).map_err(io)?;
            let mut keys = write_txn.open_table(KEYS).map_err(io)?;
            let mut reverse = write_txn.open_table(REVERSE).map_err(io)?;

            let previous: Option<StoredRecord> = match items.get(stored.item.id).map_err(io)? {
                Some(data) => Some(decode(data.value())?),
                None => None,
            };
            if let Some(old) = &previous {
                for slot in old.item.key_slots() {
                    codec::edit_slot(&mut keys, &slot, old.item.id, false)?;
                }
                for slot in old.item.reverse_slots() {
                    codec::edit_slot(&mut reverse, &slot, old.item.id, false)?;
                }
            }
            for slot in stored.item.key_slots() {
                codec::edit_slot(&mut keys, &slot, stored.item.id, true)?;
            }
            for slot in stored.item.reverse_slots() {
                codec::edit_slot(&mut reverse, &slot, stored.item.id, true)?;
            }

            let bytes = encode(&stored)?;
            items.insert(stored.item.id, bytes.as_slice()).map_err(io)?;
        }
        write_txn.commit().map_err(io)?;
        Ok(())
    }

    fn indexed_through(&self) -> Result<Tid, TrellisError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(METADATA).map_err(io)?;
        Ok(Tid(table
            .get(WATERMARK_KEY)
            .map_err(io)?
            .map(|v| v.value())
            .unwrap_or(0)))
    }

    fn mark_indexed_through(&mut self, tid: Tid) -> Result<(), TrellisError> {
        let write_txn = self.db.begin_write().map_err(io)?;
        {
            let mut meta = write_txn.open_table(METADATA).map_err(io)?;
            let current = meta
                .get(WATERMARK_KEY)
                .map_err(io)?
                .map(|v| v.value())
                .unwrap_or(0);
            meta.insert(WATERMARK_KEY, current.max(tid.0)).map_err(io)?;
        }
        write_txn.commit().map_err(io)?;
        Ok(())
    }

    fn record_count(&self) -> Result<usize, TrellisError> {
        let read_txn = self.db.begin_read().map_err(io)?;
        let table = read_txn.open_table(ITEMS).map_err(io)?;
        let len = table.len().map_err(io)?;
        usize::try_from(len).map_err(io)
    }
}
