//! # catalog-sync CLI (`csync`)
//!
//! Resolves loosely specified artist/title records against an external
//! catalog and adds the ones a target collection is missing.
//!
//! ## Usage
//!
//! ```bash
//! csync --config ./config/csync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `csync sync <file> --collection <id>` | Resolve candidates and add new items |
//! | `csync match --artist A --title T` | Resolve one record and print the match |
//! | `csync cache clear-expired` | Delete stale cache entries |
//! | `csync cache clear` | Delete every cache entry |
//!
//! The catalog bearer token is read from the environment variable named by
//! `[catalog].token_env` (default `CATALOG_TOKEN`). Logs go to stderr and
//! honor `RUST_LOG`.

use std::path::PathBuf;

use catalog_sync::config;
use catalog_sync::progress::ProgressMode;
use catalog_sync::sync_cmd;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "csync",
    about = "Resolve track records against a catalog and reconcile them into a collection",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/csync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a candidates file and add new matches to a collection.
    ///
    /// The file is CSV with `Artist,Title` headers, or a JSON array of
    /// `{artist, title}` objects.
    Sync {
        /// Candidates file (`.csv` or `.json`).
        candidates: PathBuf,

        /// Target collection id.
        #[arg(long)]
        collection: String,

        /// Write the audit CSV here (overrides `[reconcile].audit_path`).
        #[arg(long)]
        audit: Option<PathBuf>,

        /// Resolve and diff, but write nothing to the collection.
        #[arg(long)]
        dry_run: bool,

        /// Progress output on stderr. Defaults to human on a TTY, off otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Resolve a single artist/title pair.
    Match {
        #[arg(long)]
        artist: String,
        #[arg(long)]
        title: String,
    },

    /// Manage the read cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete entries older than the max age, and any unreadable entries.
    ClearExpired {
        /// Override `[cache].max_age_secs`.
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
    /// Delete every entry.
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Sync {
            candidates,
            collection,
            audit,
            dry_run,
            progress,
        } => {
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            sync_cmd::run_sync(&cfg, &candidates, &collection, audit, dry_run, progress).await?;
        }
        Commands::Match { artist, title } => {
            sync_cmd::run_match(&cfg, &artist, &title).await?;
        }
        Commands::Cache { action } => match action {
            CacheAction::ClearExpired { max_age_secs } => {
                sync_cmd::run_cache_clear_expired(&cfg, max_age_secs)?;
            }
            CacheAction::Clear => {
                sync_cmd::run_cache_clear(&cfg)?;
            }
        },
    }

    Ok(())
}
