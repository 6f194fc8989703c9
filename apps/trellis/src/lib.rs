//! # trellis
//!
//! Command-line front end for the Trellis read path: configuration loading
//! and the commands that drive `trellis-core` against the redb tiers.

pub mod cli;
pub mod config;

pub use config::{StorageConfig, TrellisConfig};
