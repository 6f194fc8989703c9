//! # Trellis CLI Module
//!
//! ## Available Commands
//!
//! - `init` - Create empty databases
//! - `load` - Create or replace items from a JSON file
//! - `reindex` - Rebuild the secondary index
//! - `render` - Render an item path
//! - `status` - Show store and index status

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use trellis_core::TrellisError;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Trellis - embedded views over a content graph
#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "trellis.toml")]
    pub config: PathBuf,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create empty databases
    Init {
        /// Replace existing databases
        #[arg(short, long)]
        force: bool,
    },

    /// Create or replace items from a JSON file
    Load {
        /// Path to a JSON array of items
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Rebuild the secondary index from the authoritative store
    Reindex,

    /// Render an item path, e.g. /genes/1/@@embedded
    Render {
        /// Item path, frame suffix optional
        path: String,

        /// Frame to render (raw, object, embedded); overrides a path suffix
        #[arg(short, long)]
        frame: Option<String>,

        /// Read the authoritative store only
        #[arg(short, long)]
        authoritative: bool,
    },

    /// Show store and index status
    Status,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli) -> Result<(), TrellisError> {
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Init { force }) => cmd_init(&cli.config, force),
        Some(Commands::Load { file }) => cmd_load(&cli.config, json_mode, &file),
        Some(Commands::Reindex) => cmd_reindex(&cli.config, json_mode),
        Some(Commands::Render {
            path,
            frame,
            authoritative,
        }) => cmd_render(
            &cli.config,
            json_mode,
            &path,
            frame.as_deref(),
            authoritative,
        ),
        Some(Commands::Status) | None => cmd_status(&cli.config, json_mode),
    }
}
