//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Keep a rolling set of videos downloaded for offline playback.
///
/// Offline-cache tracks downloads in a local database, runs transfers as
/// durable background work, and periodically refreshes the catalog to evict
/// watched videos and queue new ones.
#[derive(Parser, Debug)]
#[command(name = "offline-cache")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file to read instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true, value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// Directory downloaded videos are written to
    #[arg(long, global = true, value_name = "DIR")]
    pub download_dir: Option<PathBuf>,

    /// Catalog server base URL
    #[arg(long, global = true, value_name = "URL")]
    pub catalog: Option<String>,

    /// User the commands run as
    #[arg(long, global = true, value_name = "ID")]
    pub user: Option<String>,

    /// Maximum concurrent work units (1-16)
    #[arg(short = 'c', long, global = true, value_parser = clap::value_parser!(u8).range(1..=16))]
    pub concurrency: Option<u8>,

    #[command(subcommand)]
    pub command: Command,
}

/// Operations on the offline cache.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Request a download of a media item
    Start {
        /// Media item id
        media_item_id: String,
        /// Allow metered networks (default is unmetered only)
        #[arg(long)]
        any_network: bool,
    },
    /// Cancel a download by id
    Cancel {
        /// Download id
        download_id: String,
    },
    /// Cancel the active download of a media item
    CancelItem {
        /// Media item id
        media_item_id: String,
    },
    /// Cancel every active download
    CancelAll,
    /// Retry a failed download
    Retry {
        /// Download id
        download_id: String,
    },
    /// Delete a download and its file
    Delete {
        /// Download id
        download_id: String,
    },
    /// List downloads for the current user
    List,
    /// Show download statistics
    Stats,
    /// Run one reconciliation pass now
    Sync,
    /// Run all runnable background work, then exit
    Work,
    /// Run the worker pool and periodic sync until interrupted
    Daemon {
        /// Seconds between sync passes (overrides config)
        #[arg(long, value_parser = clap::value_parser!(u64).range(60..=86_400))]
        sync_interval: Option<u64>,
    },
}
