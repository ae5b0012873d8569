//! Cached media item records.

use sqlx::FromRow;
use tracing::instrument;

use super::{RecordStore, Result};
use crate::time::now_millis;

/// Duration ticks per second (100ns units).
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Per-user cached catalog entry.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct MediaItemRecord {
    /// Global content id.
    pub id: String,
    /// Owner of this cached view.
    pub user_id: String,
    /// Runtime in 100ns ticks.
    pub duration_ticks: i64,
    /// True while a completed download with a file on disk references this item.
    pub is_downloaded: bool,
    /// Mirror of the active download's progress (0..1).
    pub download_progress: f64,
    /// Per-user watch position as a fraction of the runtime (0..1).
    pub watched_fraction: f64,
    /// Local file path of the completed download.
    pub local_file_path: Option<String>,
    /// When the item entered the local cache (unix ms).
    pub added_at: i64,
    /// Last catalog refresh that touched this row (unix ms).
    pub refreshed_at: i64,
}

impl MediaItemRecord {
    /// Runtime in whole seconds.
    #[must_use]
    pub fn duration_seconds(&self) -> i64 {
        self.duration_ticks / TICKS_PER_SECOND
    }
}

/// Catalog fields written by a refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItemUpsert<'a> {
    pub user_id: &'a str,
    pub id: &'a str,
    pub duration_ticks: i64,
    pub watched_fraction: f64,
    /// Catalog creation time; defaults to now for rows that are new locally.
    pub added_at: Option<i64>,
}

impl RecordStore {
    /// Inserts a media item or refreshes its catalog fields.
    ///
    /// Download state (`is_downloaded`, `local_file_path`, `download_progress`)
    /// and the original `added_at` are left untouched on existing rows.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the upsert fails.
    #[instrument(skip(self, item), fields(user_id = %item.user_id, media_item_id = %item.id))]
    pub async fn upsert_media_item(&self, item: &MediaItemUpsert<'_>) -> Result<()> {
        let now = now_millis();
        sqlx::query(
            r"INSERT INTO media_items (id, user_id, duration_ticks, watched_fraction, added_at, refreshed_at)
              VALUES (?, ?, ?, ?, ?, ?)
              ON CONFLICT(user_id, id) DO UPDATE SET
                  duration_ticks = excluded.duration_ticks,
                  watched_fraction = excluded.watched_fraction,
                  refreshed_at = excluded.refreshed_at",
        )
        .bind(item.id)
        .bind(item.user_id)
        .bind(item.duration_ticks.max(0))
        .bind(item.watched_fraction.clamp(0.0, 1.0))
        .bind(item.added_at.unwrap_or(now))
        .bind(now)
        .execute(self.db.pool())
        .await?;

        self.notify_media_items(item.user_id);
        Ok(())
    }

    /// Gets a media item by its per-user key.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_media_item(
        &self,
        user_id: &str,
        media_item_id: &str,
    ) -> Result<Option<MediaItemRecord>> {
        let item = sqlx::query_as::<_, MediaItemRecord>(
            r"SELECT * FROM media_items WHERE user_id = ? AND id = ?",
        )
        .bind(user_id)
        .bind(media_item_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(item)
    }

    /// Lists a user's media items, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_media_items(&self, user_id: &str) -> Result<Vec<MediaItemRecord>> {
        let items = sqlx::query_as::<_, MediaItemRecord>(
            r"SELECT * FROM media_items WHERE user_id = ? ORDER BY added_at DESC, rowid DESC",
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(items)
    }

    /// Lists items eligible for automatic download, newest first.
    ///
    /// Eligible items are not downloaded, watched less than `max_watched_fraction`,
    /// and have no download record of any status.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn acquisition_candidates(
        &self,
        user_id: &str,
        max_watched_fraction: f64,
    ) -> Result<Vec<MediaItemRecord>> {
        let items = sqlx::query_as::<_, MediaItemRecord>(
            r"SELECT m.* FROM media_items m
              WHERE m.user_id = ?
                AND m.is_downloaded = 0
                AND m.watched_fraction < ?
                AND NOT EXISTS (
                    SELECT 1 FROM downloads d
                    WHERE d.user_id = m.user_id AND d.media_item_id = m.id
                )
              ORDER BY m.added_at DESC, m.rowid DESC",
        )
        .bind(user_id)
        .bind(max_watched_fraction)
        .fetch_all(self.db.pool())
        .await?;

        Ok(items)
    }

    /// Lists a user's downloaded items.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn downloaded_media_items(&self, user_id: &str) -> Result<Vec<MediaItemRecord>> {
        let items = sqlx::query_as::<_, MediaItemRecord>(
            r"SELECT * FROM media_items WHERE user_id = ? AND is_downloaded = 1",
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(items)
    }

    /// Clears the downloaded flag, path, and progress mirror of a media item.
    ///
    /// Returns `false` when the item does not exist; a missing item is not an error
    /// because eviction runs for downloads whose item was already dropped.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn clear_media_download(&self, user_id: &str, media_item_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE media_items
              SET is_downloaded = 0, local_file_path = NULL, download_progress = 0
              WHERE user_id = ? AND id = ?",
        )
        .bind(user_id)
        .bind(media_item_id)
        .execute(self.db.pool())
        .await?;

        let cleared = result.rows_affected() > 0;
        if cleared {
            self.notify_media_items(user_id);
        }
        Ok(cleared)
    }
}
