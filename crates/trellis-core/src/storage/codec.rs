//! # Record Codec
//!
//! postcard encoding shared by the redb tiers.
//!
//! postcard is not self-describing, so property bags travel inside the
//! records as JSON text.
//!
//! ## Slot Keys
//!
//! Lookup tables map a string slot to a postcard-encoded list of ids:
//! - unique keys: `{namespace}\u{1f}{value}`
//! - reverse links: `{target:020}\u{1f}{field}`

use super::IndexedRecord;
use crate::{Footprint, Item, ItemId, Properties, PropertySheet, Tid, TrellisError, TypeName};
use redb::{ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Table for items: id -> encoded record.
pub(crate) const ITEMS: TableDefinition<u64, &[u8]> = TableDefinition::new("items");

/// Table for unique keys: key slot -> encoded id list.
pub(crate) const KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("keys");

/// Table for reverse links: reverse slot -> encoded id list.
pub(crate) const REVERSE: TableDefinition<&str, &[u8]> = TableDefinition::new("reverse");

/// Table for metadata: name -> value.
pub(crate) const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const SLOT_SEPARATOR: char = '\u{1f}';

/// Map a storage engine error.
pub(crate) fn io(e: impl fmt::Display) -> TrellisError {
    TrellisError::IoError(e.to_string())
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TrellisError> {
    postcard::to_allocvec(value).map_err(|e| TrellisError::SerializationError(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TrellisError> {
    postcard::from_bytes(bytes).map_err(|e| TrellisError::DeserializationError(e.to_string()))
}

#[must_use]
pub(crate) fn key_slot(key: &str, value: &str) -> String {
    format!("{}{}{}", key, SLOT_SEPARATOR, value)
}

#[must_use]
pub(crate) fn reverse_slot(target: ItemId, field: &str) -> String {
    format!("{:020}{}{}", target.0, SLOT_SEPARATOR, field)
}

/// Ids listed under `slot`, empty when the slot is absent.
pub(crate) fn slot_ids<T>(table: &T, slot: &str) -> Result<Vec<u64>, TrellisError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(slot).map_err(io)? {
        Some(data) => decode(data.value()),
        None => Ok(Vec::new()),
    }
}

/// Add or remove `id` under `slot`, dropping the slot once it is empty.
pub(crate) fn edit_slot(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    slot: &str,
    id: u64,
    present: bool,
) -> Result<(), TrellisError> {
    let mut ids = slot_ids(&*table, slot)?;
    match (ids.binary_search(&id), present) {
        (Err(pos), true) => ids.insert(pos, id),
        (Ok(pos), false) => {
            ids.remove(pos);
        }
        _ => return Ok(()),
    }
    if ids.is_empty() {
        table.remove(slot).map_err(io)?;
    } else {
        let bytes = encode(&ids)?;
        table.insert(slot, bytes.as_slice()).map_err(io)?;
    }
    Ok(())
}

// =============================================================================
// RECORDS
// =============================================================================

/// On-disk form of one item version plus its lookup entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredItem {
    pub(crate) id: u64,
    pub(crate) item_type: String,
    pub(crate) tid: u64,
    pub(crate) properties: String,
    pub(crate) keys: Vec<(String, String)>,
    pub(crate) links: Vec<(String, u64)>,
}

impl StoredItem {
    pub(crate) fn new(
        item: &Item,
        keys: &[(String, String)],
        links: &[(String, ItemId)],
    ) -> Result<Self, TrellisError> {
        let properties = serde_json::to_string(item.sheet().properties())
            .map_err(|e| TrellisError::SerializationError(e.to_string()))?;
        Ok(Self {
            id: item.id().0,
            item_type: item.item_type().as_str().to_string(),
            tid: item.tid().0,
            properties,
            keys: keys.to_vec(),
            links: links.iter().map(|(f, id)| (f.clone(), id.0)).collect(),
        })
    }

    pub(crate) fn to_item(&self) -> Result<Item, TrellisError> {
        let properties: Properties = serde_json::from_str(&self.properties)
            .map_err(|e| TrellisError::DeserializationError(e.to_string()))?;
        Ok(Item::new(
            ItemId(self.id),
            TypeName::new(self.item_type.as_str()),
            PropertySheet::new(Tid(self.tid), properties),
        ))
    }

    pub(crate) fn key_slots(&self) -> impl Iterator<Item = String> + '_ {
        self.keys.iter().map(|(k, v)| key_slot(k, v))
    }

    pub(crate) fn reverse_slots(&self) -> impl Iterator<Item = String> + '_ {
        self.links
            .iter()
            .map(|(field, target)| reverse_slot(ItemId(*target), field))
    }
}

/// On-disk form of a Secondary Index record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredRecord {
    pub(crate) item: StoredItem,
    pub(crate) indexed_tid: u64,
    pub(crate) embedded: Vec<u64>,
    pub(crate) linked: Vec<u64>,
}

impl StoredRecord {
    pub(crate) fn new(record: &IndexedRecord) -> Result<Self, TrellisError> {
        Ok(Self {
            item: StoredItem::new(&record.item, &record.keys, &record.links)?,
            indexed_tid: record.indexed_tid.0,
            embedded: record.footprint.embedded.iter().map(|id| id.0).collect(),
            linked: record.footprint.linked.iter().map(|id| id.0).collect(),
        })
    }

    pub(crate) fn to_record(&self) -> Result<IndexedRecord, TrellisError> {
        Ok(IndexedRecord {
            item: self.item.to_item()?,
            indexed_tid: Tid(self.indexed_tid),
            footprint: Footprint {
                embedded: self.embedded.iter().map(|&id| ItemId(id)).collect(),
                linked: self.linked.iter().map(|&id| ItemId(id)).collect(),
            },
            keys: self.item.keys.clone(),
            links: self
                .item
                .links
                .iter()
                .map(|(f, id)| (f.clone(), ItemId(*id)))
                .collect(),
        })
    }
}
