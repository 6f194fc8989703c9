//! # trellis-core
//!
//! The read path of the Trellis content graph - THE LOGIC.
//!
//! This crate serves denormalized, embedded views of interlinked items while
//! keeping them consistent with the session's own writes:
//! - Calculated properties resolved lazily along a type's ancestor chain
//! - Sub-call embedding that records which items each view inlined or
//!   referenced, with a per-unit-of-work LRU embed cache
//! - A dual-tier storage facade that reads the Secondary Index unless the
//!   session's edit log says the record may be stale
//!
//! ## Architectural Constraints
//!
//! - Synchronous and single-threaded per unit of work: NO async, NO network
//! - The registry and schema are immutable after start-up
//! - Nothing owned by a unit of work (cache, contexts, footprints) is shared
//! - The Secondary Index is never written through and never trusted blindly

// =============================================================================
// MODULES
// =============================================================================

pub mod addressing;
pub mod cache;
pub mod calculated;
pub mod config;
pub mod context;
pub mod indexer;
pub mod paths;
pub mod primitives;
pub mod registry;
pub mod render;
pub mod schema;
pub mod session;
pub mod storage;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    Footprint, Frame, Item, ItemId, Principal, Properties, PropertySheet, Resolved, Tid,
    TrellisError, TypeName,
};

// =============================================================================
// RE-EXPORTS: Read Path
// =============================================================================

pub use addressing::{AccessPolicy, Addressing, OpenAccess};
pub use cache::{CacheStats, EmbedCache, EmbedEntry};
pub use calculated::{CalculatedDocument, Template};
pub use config::{CacheSettings, RenderLimits};
pub use context::EvalContext;
pub use indexer::{IndexReport, Indexer};
pub use registry::{CalcArgs, CalculatedProperty, Catalog, Condition, Registry, RegistryBuilder};
pub use render::{CalcCall, Rendered, Renderer};
pub use schema::{Schema, SchemaDocument, TypeInfo};
pub use session::{EditLogEntry, ReadTier, Session, SessionEditLog, UnitOfWork};

// =============================================================================
// RE-EXPORTS: Storage
// =============================================================================

pub use storage::{
    IndexStore, IndexedRecord, ItemStore, ItemWrite, MemoryIndex, MemoryStore, NewItem, RedbIndex,
    RedbStore, StorageFacade,
};
