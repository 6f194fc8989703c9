//! # Trellis
//!
//! The command-line binary for the Trellis content graph.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              apps/trellis (THE BINARY)          │
//! │                                                 │
//! │   ┌─────────────┐         ┌────────────────┐    │
//! │   │    CLI      │         │  TOML config   │    │
//! │   │   (clap)    │         │   (schema,     │    │
//! │   │             │         │  cache, paths) │    │
//! │   └──────┬──────┘         └───────┬────────┘    │
//! │          └──────────┬─────────────┘             │
//! │                     ▼                           │
//! │             ┌───────────────┐                   │
//! │             │ trellis-core  │                   │
//! │             │  (THE LOGIC)  │                   │
//! │             └───────────────┘                   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! trellis init
//! trellis load -f items.json
//! trellis reindex
//! trellis render /genes/1/@@embedded
//! trellis status --json-mode
//! ```

use clap::Parser;
use trellis::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    // TRELLIS_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("TRELLIS_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "trellis=info,trellis_core=info".into());

    // Logs go to stderr so rendered JSON on stdout stays clean.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the Trellis startup banner.
fn print_banner() {
    eprintln!(
        r#"
  ▀█▀ █▀█ █▀▀ █   █   █ █▀
   █  █▀▄ ██▄ █▄▄ █▄▄ █ ▄█

  Trellis v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
