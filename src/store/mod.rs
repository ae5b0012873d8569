//! Record store for cached media items and download attempts.
//!
//! This module provides `SQLite`-backed persistence for the two record kinds
//! the download subsystem shares with the rest of the application:
//! - [`MediaItemRecord`] - per-user cached catalog entry with download/watch state
//! - [`DownloadRecord`] - one row per download attempt
//!
//! Every write publishes a [`StoreChange`] so that reactive list queries
//! (see [`RecordStore::watch_downloads`]) can refresh without polling.
//!
//! # Example
//!
//! ```ignore
//! use offline_cache_core::{Database, RecordStore, DownloadStatus};
//!
//! let store = RecordStore::new(Database::new_in_memory().await?);
//! let mut active = store
//!     .watch_downloads("user-1", &[DownloadStatus::Pending, DownloadStatus::Downloading])
//!     .await?;
//! active.changed().await?;
//! println!("{} active downloads", active.borrow().len());
//! ```

mod download;
mod error;
mod media;
mod repository;
mod watch;

pub use download::{DownloadRecord, DownloadStatus, NewDownload, StatusTotals};
pub(crate) use download::is_duplicate_active;
pub use error::{StoreDbErrorKind, StoreError};
pub use media::{MediaItemRecord, MediaItemUpsert, TICKS_PER_SECOND};
pub use repository::DownloadRepository;

use tokio::sync::broadcast;

use crate::db::Database;

/// Capacity of the change feed; slow subscribers observe `Lagged` and re-query.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Result type for record store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Notification that rows for a user changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// One or more download rows for the user changed.
    Downloads {
        /// Owner of the changed rows.
        user_id: String,
    },
    /// One or more media item rows for the user changed.
    MediaItems {
        /// Owner of the changed rows.
        user_id: String,
    },
}

/// Durable, per-user keyed store for media items and downloads.
///
/// Writes to a single row are atomic statements or short transactions, so
/// concurrent read-modify-write from the orchestrator and the transfer worker
/// are linearized per record by `SQLite`.
#[derive(Debug, Clone)]
pub struct RecordStore {
    db: Database,
    changes: broadcast::Sender<StoreChange>,
}

impl RecordStore {
    /// Creates a record store over an opened (migrated) database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { db, changes }
    }

    /// Returns the underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Subscribes to the raw change feed.
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn notify_downloads(&self, user_id: &str) {
        // No subscribers is not an error.
        let _ = self.changes.send(StoreChange::Downloads {
            user_id: user_id.to_string(),
        });
    }

    fn notify_media_items(&self, user_id: &str) {
        let _ = self.changes.send(StoreChange::MediaItems {
            user_id: user_id.to_string(),
        });
    }
}

/// Returns `Ok(())` if at least one row was affected; otherwise [`StoreError::RecordNotFound`].
fn check_affected(what: &str, id: &str, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::RecordNotFound(format!("{what} {id}")))
    } else {
        Ok(())
    }
}
