//! # Indexer
//!
//! Builds Secondary Index records from the Authoritative Store.
//!
//! A record's footprint comes from the same renderer that serves requests,
//! rendering at the embedded frame, so the footprints the facade checks
//! are exactly what a live render would produce. When and how often the
//! index is rebuilt is up to the caller.

use crate::addressing::OpenAccess;
use crate::config::{CacheSettings, RenderLimits};
use crate::registry::Catalog;
use crate::render::Renderer;
use crate::session::{ReadTier, SessionEditLog, UnitOfWork};
use crate::storage::{IndexedRecord, StorageFacade};
use crate::{Frame, Item, ItemId, Tid, TrellisError};

/// Outcome of a full rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexReport {
    /// Records written.
    pub records: usize,
    /// The index is now complete through this tid.
    pub indexed_through: Tid,
}

/// Renders items into index records.
#[derive(Debug)]
pub struct Indexer<'a> {
    catalog: &'a Catalog,
    cache: CacheSettings,
    limits: RenderLimits,
}

impl<'a> Indexer<'a> {
    /// Create an indexer with default settings.
    #[must_use]
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            cache: CacheSettings::default(),
            limits: RenderLimits::default(),
        }
    }

    /// Use explicit cache and render settings.
    #[must_use]
    pub fn with_settings(mut self, cache: CacheSettings, limits: RenderLimits) -> Self {
        self.cache = cache;
        self.limits = limits;
        self
    }

    fn unit_of_work(&self) -> UnitOfWork {
        UnitOfWork::new(SessionEditLog::new(), self.cache.clone(), self.limits)
            .with_tier(ReadTier::Authoritative)
    }

    /// Build the record of one item as of `indexed_tid`.
    pub fn build_record(
        &self,
        facade: &StorageFacade,
        item: &Item,
        indexed_tid: Tid,
    ) -> Result<IndexedRecord, TrellisError> {
        let mut uow = self.unit_of_work();
        self.record_in(facade, &mut uow, item, indexed_tid)
    }

    fn record_in(
        &self,
        facade: &StorageFacade,
        uow: &mut UnitOfWork,
        item: &Item,
        indexed_tid: Tid,
    ) -> Result<IndexedRecord, TrellisError> {
        let schema = &self.catalog.schema;
        let rendered =
            Renderer::new(self.catalog, facade, &OpenAccess, uow).render_item(item, Frame::Embedded)?;
        let properties = item.sheet().properties();
        Ok(IndexedRecord {
            item: item.clone(),
            indexed_tid,
            footprint: rendered.footprint,
            keys: schema.unique_key_values(item.item_type(), properties),
            links: schema.links(item.item_type(), properties),
        })
    }

    /// Rebuild the record of every stored item and advance the watermark.
    pub fn reindex_all(&self, facade: &mut StorageFacade) -> Result<IndexReport, TrellisError> {
        let tid = facade.authoritative().current_tid()?;
        let ids = facade.authoritative().item_ids()?;
        let records = self.records_for(facade, &ids, tid)?;

        let count = records.len();
        for record in records {
            facade.index_mut().put(record)?;
        }
        facade.index_mut().mark_indexed_through(tid)?;
        tracing::info!(records = count, indexed_through = %tid, "secondary index rebuilt");
        Ok(IndexReport {
            records: count,
            indexed_through: tid,
        })
    }

    /// Build records for `ids` in one unit of work, sharing its embed cache.
    fn records_for(
        &self,
        facade: &StorageFacade,
        ids: &[ItemId],
        tid: Tid,
    ) -> Result<Vec<IndexedRecord>, TrellisError> {
        let mut uow = self.unit_of_work();
        let mut records = Vec::with_capacity(ids.len());
        for &id in ids {
            let Some(item) = facade.authoritative().get_by_id(id)? else {
                continue;
            };
            records.push(self.record_in(facade, &mut uow, &item, tid)?);
        }
        Ok(records)
    }
}
