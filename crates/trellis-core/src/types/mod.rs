//! # Core Type Definitions
//!
//! This module contains the core types of the Trellis read path:
//! - Identifiers (`ItemId`, `Tid`, `TypeName`)
//! - Stored data (`PropertySheet`, `Item`)
//! - Render outputs (`Frame`, `Resolved`, `Footprint`)
//! - Call identity (`Principal`)
//! - Error types (`TrellisError`)
//!
//! ## Determinism Guarantees
//!
//! All collections in this module are `BTreeMap`/`BTreeSet`, so iteration
//! order (and therefore rendered output and footprints) is deterministic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Stable identifier of an item. Never reused, never changes across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl ItemId {
    /// Read an identifier out of a stored link value.
    ///
    /// Links are stored as JSON unsigned integers.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_u64().map(Self)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction id stamped on every committed write.
///
/// Strictly increasing within one authoritative store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Tid(pub u64);

impl Tid {
    /// The tid before any write.
    pub const ZERO: Self = Self(0);

    /// The tid following this one (saturating).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of an item type declared in the schema.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeName(pub String);

impl TypeName {
    /// Create a new type name.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the type name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// STORED DATA
// =============================================================================

/// Stored properties of one item version.
pub type Properties = BTreeMap<String, Value>;

/// An immutable, versioned bag of stored properties.
///
/// A sheet is never edited in place: a write produces a new sheet
/// stamped with the committing tid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySheet {
    tid: Tid,
    properties: Properties,
}

impl PropertySheet {
    /// Create a sheet stamped with `tid`.
    #[must_use]
    pub fn new(tid: Tid, properties: Properties) -> Self {
        Self { tid, properties }
    }

    /// The tid that committed this version.
    #[must_use]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// All stored properties.
    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }
}

/// An addressable, versioned record.
///
/// Cloning an `Item` shares its property sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    id: ItemId,
    item_type: TypeName,
    sheet: Arc<PropertySheet>,
}

impl Item {
    /// Create an item from its parts.
    #[must_use]
    pub fn new(id: ItemId, item_type: TypeName, sheet: PropertySheet) -> Self {
        Self {
            id,
            item_type,
            sheet: Arc::new(sheet),
        }
    }

    /// The stable identifier.
    #[must_use]
    pub fn id(&self) -> ItemId {
        self.id
    }

    /// The most specific type of the item.
    #[must_use]
    pub fn item_type(&self) -> &TypeName {
        &self.item_type
    }

    /// The current property sheet.
    #[must_use]
    pub fn sheet(&self) -> &PropertySheet {
        &self.sheet
    }

    /// Tid of the current version.
    #[must_use]
    pub fn tid(&self) -> Tid {
        self.sheet.tid()
    }

    /// Look up a single stored property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.sheet.properties().get(name)
    }

    /// The stored `status` property, if it is a string.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.property("status").and_then(Value::as_str)
    }

    /// Whether the item has been soft-deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.status() == Some("deleted")
    }
}

// =============================================================================
// RENDER OUTPUTS
// =============================================================================

/// Render depth requested for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frame {
    /// Stored properties verbatim; links stay identifiers.
    Raw,
    /// Stored properties with links as paths, plus calculated properties.
    Object,
    /// Object frame with the type's embedded paths expanded inline.
    Embedded,
}

impl Frame {
    /// The name used in `@@frame` path suffixes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Object => "object",
            Self::Embedded => "embedded",
        }
    }
}

impl FromStr for Frame {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Self::Raw),
            "object" => Ok(Self::Object),
            "embedded" => Ok(Self::Embedded),
            other => Err(TrellisError::InvalidPath(format!("unknown frame @@{}", other))),
        }
    }
}

/// Outcome of resolving an attribute.
///
/// `Missing` is not an error: the attribute is simply absent.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// The attribute has a value.
    Found(Value),
    /// The attribute does not exist for this item.
    Missing,
}

impl Resolved {
    /// Check if a value was found.
    #[must_use]
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    /// Borrow the value, if any.
    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Found(v) => Some(v),
            Self::Missing => None,
        }
    }

    /// Convert into an `Option`.
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Found(v) => Some(v),
            Self::Missing => None,
        }
    }
}

impl From<Option<Value>> for Resolved {
    fn from(value: Option<Value>) -> Self {
        value.map_or(Self::Missing, Self::Found)
    }
}

/// Dependency footprint of a render.
///
/// - `embedded`: items whose content was materialised into the output
/// - `linked`: items referenced only by path
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Footprint {
    /// Items inlined into the render.
    pub embedded: BTreeSet<ItemId>,
    /// Items referenced by path only.
    pub linked: BTreeSet<ItemId>,
}

impl Footprint {
    /// Create an empty footprint.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Union another footprint into this one.
    pub fn merge(&mut self, other: &Self) {
        self.embedded.extend(other.embedded.iter().copied());
        self.linked.extend(other.linked.iter().copied());
    }

    /// Record an inlined item.
    pub fn embed(&mut self, id: ItemId) {
        self.embedded.insert(id);
    }

    /// Record a referenced item.
    pub fn link(&mut self, id: ItemId) {
        self.linked.insert(id);
    }

    /// Check if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.embedded.is_empty() && self.linked.is_empty()
    }
}

// =============================================================================
// PRINCIPAL
// =============================================================================

/// Identity a render runs as.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Principal {
    /// The session's own identity. Results may be shared through the embed cache.
    #[default]
    Session,
    /// An explicit "render as" identity. Never cached.
    As(String),
}

impl Principal {
    /// Check if this is the session's own identity.
    #[must_use]
    pub fn is_default(&self) -> bool {
        matches!(self, Self::Session)
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the Trellis read and write paths.
///
/// - A missing attribute is not an error (see `Resolved::Missing`)
/// - Errors raised by calculated properties are never caught by the resolver
#[derive(Debug, Error)]
pub enum TrellisError {
    /// A path or identifier did not resolve to an item.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The principal may not see the addressed item.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A type name is not declared in the schema.
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// A schema-required link points at nothing.
    #[error("Required link {field} on item {item} is missing")]
    RequiredLinkMissing {
        /// The item carrying the link.
        item: ItemId,
        /// The link field.
        field: String,
    },

    /// A calculated property failed.
    #[error("Calculated property {property} failed: {message}")]
    Compute {
        /// The failing property.
        property: String,
        /// What went wrong.
        message: String,
    },

    /// A calculated property depends on itself.
    #[error("Calculated property cycle: {0}")]
    CalculatedCycle(String),

    /// A path is embedded while it is already being embedded.
    #[error("Embed cycle through {0}")]
    EmbedCycle(String),

    /// Nested embedding went deeper than the configured limit.
    #[error("Embed depth exceeded at {0}")]
    EmbedDepthExceeded(String),

    /// A path could not be parsed or normalized.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The schema or registry is inconsistent.
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// A write would give two items the same unique key.
    #[error("Unique key {key}={value} is already taken")]
    UniqueKeyConflict {
        /// Key namespace.
        key: String,
        /// Key value.
        value: String,
    },

    /// Optimistic concurrency check failed.
    #[error("Conflict on item {id}: expected tid {expected}, found {actual}")]
    Conflict {
        /// The contended item.
        id: ItemId,
        /// The tid the writer based its change on.
        expected: Tid,
        /// The tid currently stored.
        actual: Tid,
    },

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// An I/O or storage engine error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

impl TrellisError {
    /// Check if this is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

// =============================================================================
// TESTS
// =============================================================================
