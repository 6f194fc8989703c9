//! # Configuration
//!
//! Trellis reads one TOML file. Every section is optional:
//!
//! ```toml
//! [storage]
//! authoritative = "trellis.db"
//! index = "trellis-index.db"
//!
//! [cache]
//! default_capacity = 128
//! capacities = { embed = 1000 }
//!
//! [limits]
//! max_embed_depth = 32
//! max_calc_depth = 64
//!
//! [[schema.types]]
//! name = "Gene"
//! unique_keys = ["symbol"]
//! embedded = ["organism"]
//! properties.organism = { link_to = "Organism", required = true }
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use trellis_core::{
    CacheSettings, Catalog, RedbIndex, RedbStore, RegistryBuilder, RenderLimits, SchemaDocument,
    Session, StorageFacade, TrellisError,
};

/// Maximum configuration file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

// =============================================================================
// CONFIG TYPES
// =============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrellisConfig {
    /// Database locations.
    pub storage: StorageConfig,
    /// Named cache capacities.
    pub cache: CacheSettings,
    /// Render recursion bounds.
    pub limits: RenderLimits,
    /// Type metadata and declarative calculated properties.
    pub schema: SchemaDocument,
}

/// Where the two storage tiers live.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Authoritative Store database file.
    pub authoritative: PathBuf,
    /// Secondary Index database file.
    pub index: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            authoritative: PathBuf::from("trellis.db"),
            index: PathBuf::from("trellis-index.db"),
        }
    }
}

// =============================================================================
// LOADING
// =============================================================================

impl TrellisConfig {
    /// Parse a TOML document.
    pub fn from_toml(source: &str) -> Result<Self, TrellisError> {
        toml::from_str(source)
            .map_err(|e| TrellisError::DeserializationError(format!("config: {}", e)))
    }

    /// Load `path`, falling back to defaults when it does not exist.
    ///
    /// Relative storage paths are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, TrellisError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let metadata = std::fs::metadata(path)
            .map_err(|e| TrellisError::IoError(format!("Cannot read config metadata: {}", e)))?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(TrellisError::IoError(format!(
                "Config size {} bytes exceeds maximum allowed {} bytes",
                metadata.len(),
                MAX_CONFIG_FILE_SIZE
            )));
        }
        let source = std::fs::read_to_string(path)
            .map_err(|e| TrellisError::IoError(format!("Read config: {}", e)))?;
        let mut config = Self::from_toml(&source)?;

        if let Some(dir) = path.parent() {
            config.storage.authoritative = dir.join(&config.storage.authoritative);
            config.storage.index = dir.join(&config.storage.index);
        }
        tracing::debug!(
            path = %path.display(),
            types = config.schema.types.len(),
            "loaded config"
        );
        Ok(config)
    }

    // =========================================================================
    // BUILDERS
    // =========================================================================

    /// Compile the schema section.
    pub fn catalog(&self) -> Result<Catalog, TrellisError> {
        Catalog::from_document(&self.schema, RegistryBuilder::new())
    }

    /// Open both redb tiers.
    pub fn open_facade(&self) -> Result<StorageFacade, TrellisError> {
        let store = RedbStore::open(&self.storage.authoritative)?;
        let index = RedbIndex::open(&self.storage.index)?;
        Ok(StorageFacade::new(store, index))
    }

    /// A session using the configured cache and render settings.
    #[must_use]
    pub fn session(&self) -> Session {
        Session::with_settings(self.cache.clone(), self.limits)
    }
}

// =============================================================================
// TESTS
// =============================================================================
