//! # CLI Command Implementations
//!
//! Each command loads the configuration, opens the redb tiers and runs as
//! one unit of work of a fresh session.

use crate::config::TrellisConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use trellis_core::primitives::MAX_RUN_ATTEMPTS;
use trellis_core::{
    Catalog, Frame, Indexer, Item, ItemId, NewItem, OpenAccess, Properties, ReadTier, Renderer,
    StorageFacade, TrellisError, UnitOfWork, paths,
};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum file size for loading items (100 MB).
const MAX_LOAD_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), TrellisError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| TrellisError::IoError(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(TrellisError::IoError(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Canonicalize an input path and make sure it is a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, TrellisError> {
    let canonical = path.canonicalize().map_err(|e| {
        TrellisError::IoError(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(TrellisError::IoError(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    );
}

fn open(config_path: &Path) -> Result<(TrellisConfig, Catalog, StorageFacade), TrellisError> {
    let config = TrellisConfig::load(config_path)?;
    let catalog = config.catalog()?;
    let facade = config.open_facade()?;
    Ok((config, catalog, facade))
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create empty databases for both tiers.
pub fn cmd_init(config_path: &Path, force: bool) -> Result<(), TrellisError> {
    let config = TrellisConfig::load(config_path)?;

    for path in [&config.storage.authoritative, &config.storage.index] {
        if path.exists() {
            if !force {
                return Err(TrellisError::IoError(format!(
                    "Database '{}' already exists. Use --force to overwrite.",
                    path.display()
                )));
            }
            std::fs::remove_file(path)
                .map_err(|e| TrellisError::IoError(format!("Remove database: {}", e)))?;
        }
    }

    config.open_facade()?;
    tracing::info!(
        authoritative = %config.storage.authoritative.display(),
        index = %config.storage.index.display(),
        "initialized databases"
    );
    println!("Initialized databases:");
    println!("  Authoritative: {:?}", config.storage.authoritative);
    println!("  Index:         {:?}", config.storage.index);
    Ok(())
}

// =============================================================================
// LOAD COMMAND
// =============================================================================

/// One entry of a load file.
#[derive(Debug, Deserialize)]
struct LoadRecord {
    #[serde(rename = "@type")]
    item_type: String,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    properties: Properties,
}

/// Create the record's item, or replace the properties of an existing one.
fn upsert(
    catalog: &Catalog,
    facade: &mut StorageFacade,
    uow: &mut UnitOfWork,
    record: &LoadRecord,
) -> Result<Item, TrellisError> {
    let id = record.id.map(ItemId);
    if let Some(id) = id
        && let Some(existing) = facade.authoritative().get_by_id(id)?
    {
        if existing.item_type().as_str() != record.item_type {
            return Err(TrellisError::InvalidSchema(format!(
                "item {} is a {}, cannot load it as {}",
                id,
                existing.item_type(),
                record.item_type
            )));
        }
        return facade.update(&catalog.schema, uow, id, record.properties.clone(), None);
    }

    let mut new = NewItem::new(record.item_type.as_str(), record.properties.clone());
    if let Some(id) = id {
        new = new.with_id(id);
    }
    facade.create(&catalog.schema, uow, new)
}

/// Create or replace items from a JSON array.
pub fn cmd_load(config_path: &Path, json_mode: bool, file: &Path) -> Result<(), TrellisError> {
    let (config, catalog, mut facade) = open(config_path)?;

    let validated = validate_file_path(file)?;
    validate_file_size(&validated, MAX_LOAD_FILE_SIZE)?;
    let contents = std::fs::read(&validated)
        .map_err(|e| TrellisError::IoError(format!("Read file: {}", e)))?;
    let records: Vec<LoadRecord> = serde_json::from_slice(&contents)
        .map_err(|e| TrellisError::DeserializationError(format!("load file: {}", e)))?;

    tracing::info!(file = %validated.display(), items = records.len(), "loading items");

    // Upserts are idempotent, so a conflicting attempt is replayed whole.
    let mut session = config.session();
    let written = session.run(MAX_RUN_ATTEMPTS, |uow| {
        records
            .iter()
            .map(|record| upsert(&catalog, &mut facade, uow, record).map(|item| item.id()))
            .collect::<Result<Vec<_>, _>>()
    })?;
    let latest = session.edits().latest_tid();

    if json_mode {
        print_json(&serde_json::json!({
            "written": written.len(),
            "ids": written.iter().map(|id| id.0).collect::<Vec<_>>(),
            "latest_tid": latest.map(|t| t.0),
        }));
        return Ok(());
    }

    println!("Loaded {} items", written.len());
    if let Some(tid) = latest {
        println!("Latest tid: {}", tid);
    }
    println!("Run `trellis reindex` to bring the secondary index up to date.");
    Ok(())
}

// =============================================================================
// REINDEX COMMAND
// =============================================================================

/// Rebuild every index record.
pub fn cmd_reindex(config_path: &Path, json_mode: bool) -> Result<(), TrellisError> {
    let (config, catalog, mut facade) = open(config_path)?;

    let report = Indexer::new(&catalog)
        .with_settings(config.cache.clone(), config.limits)
        .reindex_all(&mut facade)?;

    if json_mode {
        print_json(&serde_json::json!({
            "records": report.records,
            "indexed_through": report.indexed_through.0,
        }));
        return Ok(());
    }

    println!("Reindexed {} records", report.records);
    println!("Indexed through tid {}", report.indexed_through);
    Ok(())
}

// =============================================================================
// RENDER COMMAND
// =============================================================================

/// Render one item path.
pub fn cmd_render(
    config_path: &Path,
    json_mode: bool,
    path: &str,
    frame: Option<&str>,
    authoritative: bool,
) -> Result<(), TrellisError> {
    let path = match frame {
        Some(name) => {
            let (item_path, _) = paths::split_frame(&paths::normalize("/", path)?)?;
            paths::with_frame(&item_path, name.parse::<Frame>()?)
        }
        None => path.to_string(),
    };
    let path = path.as_str();
    let (config, catalog, facade) = open(config_path)?;
    let mut session = config.session();

    let mut uow = session.unit_of_work();
    if authoritative {
        uow = uow.with_tier(ReadTier::Authoritative);
    }
    let rendered = Renderer::new(&catalog, &facade, &OpenAccess, &mut uow).render_path(path)?;
    let stats = uow.cache_stats().unwrap_or_default();
    session.complete(uow);

    if json_mode {
        print_json(&serde_json::json!({
            "path": path,
            "value": *rendered.value,
            "footprint": rendered.footprint,
            "cache": {
                "hits": stats.hits,
                "misses": stats.misses,
                "evictions": stats.evictions,
            },
        }));
        return Ok(());
    }

    print_json(&rendered.value);
    Ok(())
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show store and index status.
pub fn cmd_status(config_path: &Path, json_mode: bool) -> Result<(), TrellisError> {
    let (config, catalog, facade) = open(config_path)?;

    let items = facade.authoritative().item_ids()?.len();
    let tid = facade.authoritative().current_tid()?;
    let records = facade.index().record_count()?;
    let indexed = facade.index().indexed_through()?;
    let lag = tid.0.saturating_sub(indexed.0);
    let types = catalog.schema.type_names().count();

    if json_mode {
        print_json(&serde_json::json!({
            "authoritative": config.storage.authoritative.to_string_lossy(),
            "index": config.storage.index.to_string_lossy(),
            "types": types,
            "items": items,
            "current_tid": tid.0,
            "index_records": records,
            "indexed_through": indexed.0,
            "index_lag": lag,
        }));
        return Ok(());
    }

    println!("Trellis Status");
    println!("==============");
    println!("Authoritative: {:?}", config.storage.authoritative);
    println!("Index:         {:?}", config.storage.index);
    println!();
    println!("Types:           {}", types);
    println!("Items:           {}", items);
    println!("Current tid:     {}", tid);
    println!("Index records:   {}", records);
    println!("Indexed through: {}", indexed);
    println!("Index lag:       {} tids", lag);
    Ok(())
}
