//! # BasketLens CLI (`blens`)
//!
//! The `blens` binary is the primary interface for BasketLens. It provides
//! commands for database initialization, trip ingestion, product-name
//! resolution, report generation, and pipeline statistics.
//!
//! ## Usage
//!
//! ```bash
//! blens --config ./config/blens.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `blens init` | Create the SQLite database and run schema migrations |
//! | `blens ingest tickets` | Ingest ticket CSVs (one file per shopping trip) |
//! | `blens ingest ocr` | Transcribe receipt photos via the vision oracle |
//! | `blens resolve` | Resolve product names to canonical foods |
//! | `blens report` | Write the nutrition report CSVs |
//! | `blens stats` | Show database and resolution statistics |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! blens init --config ./config/blens.toml
//!
//! # Ingest a directory of ticket CSVs
//! blens ingest tickets --config ./config/blens.toml
//!
//! # See how many names still need the oracle, without calling it
//! blens resolve --dry-run
//!
//! # Resolve the first 50 unresolved names with JSON progress
//! blens resolve --limit 50 --progress json
//!
//! # Generate the report
//! blens report --config ./config/blens.toml
//! ```

mod config;
mod db;
mod enrich;
mod ingest;
mod migrate;
mod models;
mod ocr;
mod oracle;
mod progress;
mod quantity;
mod reference;
mod report;
mod resolver;
mod retriever;
mod stats;
mod trips;
mod yearly;

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use progress::ProgressMode;

/// BasketLens CLI — turn grocery receipts into yearly nutrition reports.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/blens.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "blens",
    about = "BasketLens — turn grocery receipts into yearly nutrition reports",
    version,
    long_about = "BasketLens ingests shopping trips (ticket CSVs or receipt photos), resolves \
    product names to a canonical food database using BM25 retrieval plus an LLM oracle, and \
    aggregates per-trip nutrients into yearly summaries against adult daily reference values."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/blens.toml`. All database, reference, oracle,
    /// and report settings are read from this file.
    #[arg(long, global = true, default_value = "./config/blens.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (purchases, match_cache, receipt_files). This command is
    /// idempotent — running it multiple times is safe.
    Init,

    /// Ingest shopping trips from an adapter.
    ///
    /// Adapters normalize raw inputs into purchase rows keyed by
    /// `(source_file, line_no)`, so re-running over the same directory
    /// never duplicates rows.
    Ingest {
        #[command(subcommand)]
        adapter: IngestAdapter,
    },

    /// Resolve product names to canonical foods.
    ///
    /// Retrieves a BM25 candidate shortlist for every distinct unresolved
    /// product name and asks the oracle to pick one (or none). Results are
    /// cached write-once; a rerun over unchanged purchases makes zero
    /// oracle calls.
    Resolve {
        /// Maximum number of names to resolve in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Show how many names need resolution without calling the oracle.
        #[arg(long)]
        dry_run: bool,

        /// Progress reporting: `off`, `human`, or `json`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Generate the nutrition report.
    ///
    /// Joins purchases, matches, and the nutrient reference into per-trip
    /// and yearly CSV files under the configured output directory. Output
    /// is deterministic: rerunning over unchanged inputs produces
    /// byte-identical files.
    Report {
        /// Restrict the report to trips from this calendar year.
        #[arg(long)]
        year: Option<i32>,
    },

    /// Show database and resolution statistics.
    ///
    /// Purchase and trip counts, match-cache coverage, and a per-source
    /// breakdown. Useful for checking pipeline progress between steps.
    Stats,
}

/// Ingestion adapters.
#[derive(Subcommand)]
enum IngestAdapter {
    /// Ingest ticket CSVs (one file per trip, named `YYYY_MM_DD*.csv`).
    Tickets,

    /// Transcribe receipt photos via the vision oracle.
    ///
    /// Images are content-hashed and skipped when already transcribed,
    /// so interrupted runs resume where they left off.
    Ocr {
        /// Progress reporting: `off`, `human`, or `json`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },
}

fn progress_mode(flag: Option<&str>) -> anyhow::Result<ProgressMode> {
    match flag {
        None => Ok(ProgressMode::default_for_tty()),
        Some("off") => Ok(ProgressMode::Off),
        Some("human") => Ok(ProgressMode::Human),
        Some("json") => Ok(ProgressMode::Json),
        Some(other) => bail!(
            "Unknown progress mode: '{}'. Must be off, human, or json.",
            other
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { adapter } => match adapter {
            IngestAdapter::Tickets => {
                ingest::run_ingest_tickets(&cfg).await?;
            }
            IngestAdapter::Ocr { progress } => {
                let mode = progress_mode(progress.as_deref())?;
                ocr::run_ingest_ocr(&cfg, mode.reporter()).await?;
            }
        },
        Commands::Resolve {
            limit,
            dry_run,
            progress,
        } => {
            let mode = progress_mode(progress.as_deref())?;
            resolver::run_resolve(&cfg, limit, dry_run, mode.reporter()).await?;
        }
        Commands::Report { year } => {
            report::run_report(&cfg, year).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
