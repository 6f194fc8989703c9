//! # Primitives
//!
//! Compiled-in constants and limits for the Trellis read path.
//! Tunable values here are only defaults; `config` lets deployments override them.

/// Name of the embed cache instance owned by every unit of work.
pub const EMBED_CACHE: &str = "embed";

/// Default capacity of a named cache instance with no explicit setting.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Maximum nesting of embed sub-calls within one render.
///
/// Embedded lists are finite, so legitimate renders stay shallow;
/// this bounds calculated properties that embed each other.
pub const MAX_EMBED_DEPTH: usize = 32;

/// Maximum nesting of calculated-property evaluation within one item.
pub const MAX_CALC_DEPTH: usize = 64;

/// Attempts `Session::run` makes before surfacing a write conflict.
pub const MAX_RUN_ATTEMPTS: usize = 3;

/// Frame suffix separator in paths (`/genes/1/@@object`).
pub const FRAME_MARKER: &str = "@@";

/// Separator between a unique-key namespace and its owning type.
pub const KEY_NAMESPACE_SEPARATOR: char = ':';
