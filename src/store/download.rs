//! Download attempt records and their status lifecycle.

use std::fmt;

use sqlx::{FromRow, QueryBuilder, Row, Sqlite};
use tracing::{debug, instrument};

use super::{RecordStore, Result, StoreError, check_affected};
use crate::time::now_millis;

/// Status of a download attempt.
///
/// `Pending → Downloading → {Completed | Failed | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadStatus {
    /// Admitted, waiting for the scheduler to run the transfer.
    Pending,
    /// Bytes are being transferred.
    Downloading,
    /// File is on disk.
    Completed,
    /// Transfer failed after the scheduler's retries were exhausted.
    Failed,
    /// Cancelled by the user or a bulk teardown.
    Cancelled,
}

impl DownloadStatus {
    /// Non-terminal statuses; at most one row per (user, item) may hold one of these.
    pub const ACTIVE: [Self; 2] = [Self::Pending, Self::Downloading];

    /// Every status, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Downloading,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// True for `Pending` and `Downloading`.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Downloading)
    }

    /// True for `Completed`, `Failed`, and `Cancelled`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Terminal statuses that a new `start` or `retry` may replace.
    #[must_use]
    pub fn is_supersedable(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid download status: {s}")),
        }
    }
}

/// A single download attempt.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct DownloadRecord {
    /// Opaque id generated by the orchestrator.
    pub id: String,
    /// Content id of the media item.
    pub media_item_id: String,
    /// Owner of the attempt.
    pub user_id: String,
    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Fraction transferred (0..1), never decreasing while downloading.
    pub progress: f64,
    /// Bytes written to the partial file.
    pub downloaded_bytes: i64,
    /// Estimated or server-reported size.
    pub total_bytes: i64,
    /// Final file path, set only on completion.
    pub local_file_path: Option<String>,
    /// Last transfer error.
    pub error_message: Option<String>,
    /// Handle of the scheduler work unit running this attempt.
    pub scheduler_work_id: Option<String>,
    /// Whether the transfer is restricted to unmetered networks.
    pub wifi_only: bool,
    /// Creation time (unix ms).
    pub started_at: i64,
    /// Completion time (unix ms).
    pub completed_at: Option<i64>,
    /// Last write time (unix ms).
    pub last_modified_at: i64,
}

impl DownloadRecord {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Failed` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.status_str.parse().unwrap_or(DownloadStatus::Failed)
    }
}

impl fmt::Display for DownloadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DownloadRecord {{ id: {}, media_item_id: {}, status: {} }}",
            self.id,
            self.media_item_id,
            self.status()
        )
    }
}

/// Fields for a freshly admitted download.
#[derive(Debug, Clone)]
pub struct NewDownload<'a> {
    pub id: &'a str,
    pub media_item_id: &'a str,
    pub user_id: &'a str,
    pub total_bytes: i64,
    pub wifi_only: bool,
}

/// Row count and byte total for one status.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct StatusTotals {
    #[sqlx(rename = "status")]
    pub status_str: String,
    pub count: i64,
    pub bytes: i64,
}

/// SQL list of the active statuses for `IN (...)` clauses.
const ACTIVE_SQL: &str = "('pending', 'downloading')";

impl RecordStore {
    /// Inserts a new `Pending` download.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] with kind `Constraint` when the
    /// user already has an active download for the item.
    #[instrument(skip(self, download), fields(download_id = %download.id, media_item_id = %download.media_item_id))]
    pub async fn insert_download(&self, download: &NewDownload<'_>) -> Result<DownloadRecord> {
        let now = now_millis();
        let record = sqlx::query_as::<_, DownloadRecord>(
            r"INSERT INTO downloads (
                id, media_item_id, user_id, status, total_bytes, wifi_only,
                started_at, last_modified_at
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING *",
        )
        .bind(download.id)
        .bind(download.media_item_id)
        .bind(download.user_id)
        .bind(DownloadStatus::Pending.as_str())
        .bind(download.total_bytes.max(0))
        .bind(download.wifi_only)
        .bind(now)
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;

        self.notify_downloads(download.user_id);
        Ok(record)
    }

    /// Gets a download by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_download(&self, id: &str) -> Result<Option<DownloadRecord>> {
        let record = sqlx::query_as::<_, DownloadRecord>(r"SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(record)
    }

    /// Finds the download for a user's media item, preferring an active row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn find_download_for_media(
        &self,
        user_id: &str,
        media_item_id: &str,
    ) -> Result<Option<DownloadRecord>> {
        let record = sqlx::query_as::<_, DownloadRecord>(&format!(
            r"SELECT * FROM downloads
              WHERE user_id = ? AND media_item_id = ?
              ORDER BY (status IN {ACTIVE_SQL}) DESC, started_at DESC
              LIMIT 1"
        ))
        .bind(user_id)
        .bind(media_item_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(record)
    }

    /// Stores the scheduler work handle on a download.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if the download does not exist.
    #[instrument(skip(self))]
    pub async fn set_scheduler_work_id(&self, id: &str, work_id: &str) -> Result<()> {
        let row = sqlx::query(
            r"UPDATE downloads SET scheduler_work_id = ?, last_modified_at = ?
              WHERE id = ?
              RETURNING user_id",
        )
        .bind(work_id)
        .bind(now_millis())
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        let Some(row) = row else {
            return check_affected("download", id, 0);
        };
        self.notify_downloads(row.get::<String, _>("user_id").as_str());
        Ok(())
    }

    /// Records transfer progress and moves `Pending` to `Downloading`.
    ///
    /// Progress never decreases. Rows that already reached a terminal status are
    /// left untouched and `false` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn record_progress(
        &self,
        id: &str,
        downloaded_bytes: i64,
        total_bytes: i64,
        progress: f64,
    ) -> Result<bool> {
        let mut tx = self.db.pool().begin().await?;
        let row = sqlx::query(&format!(
            r"UPDATE downloads
              SET status = ?,
                  downloaded_bytes = ?,
                  total_bytes = ?,
                  progress = MAX(progress, ?),
                  last_modified_at = ?
              WHERE id = ? AND status IN {ACTIVE_SQL}
              RETURNING user_id, media_item_id, progress"
        ))
        .bind(DownloadStatus::Downloading.as_str())
        .bind(downloaded_bytes.max(0))
        .bind(total_bytes.max(0))
        .bind(progress.clamp(0.0, 1.0))
        .bind(now_millis())
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            debug!("progress ignored for inactive download");
            return Ok(false);
        };
        let user_id: String = row.get("user_id");
        let media_item_id: String = row.get("media_item_id");
        let stored_progress: f64 = row.get("progress");

        sqlx::query(r"UPDATE media_items SET download_progress = ? WHERE user_id = ? AND id = ?")
            .bind(stored_progress)
            .bind(&user_id)
            .bind(&media_item_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.notify_downloads(&user_id);
        self.notify_media_items(&user_id);
        Ok(true)
    }

    /// Records a retryable transfer error while leaving the download active.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn record_transient_error(&self, id: &str, message: &str) -> Result<bool> {
        let row = sqlx::query(&format!(
            r"UPDATE downloads SET error_message = ?, last_modified_at = ?
              WHERE id = ? AND status IN {ACTIVE_SQL}
              RETURNING user_id"
        ))
        .bind(message)
        .bind(now_millis())
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(self.finish_conditional_write(row))
    }

    /// Marks an active download completed and flips its media item to downloaded.
    ///
    /// Both rows change in one transaction. Returns `false` (and writes nothing)
    /// when the download is no longer active, e.g. it was cancelled mid-transfer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if either update fails.
    #[instrument(skip(self))]
    pub async fn complete_download(
        &self,
        id: &str,
        local_file_path: &str,
        total_bytes: i64,
    ) -> Result<bool> {
        let now = now_millis();
        let mut tx = self.db.pool().begin().await?;
        let row = sqlx::query(&format!(
            r"UPDATE downloads
              SET status = ?,
                  progress = 1.0,
                  downloaded_bytes = ?,
                  total_bytes = ?,
                  local_file_path = ?,
                  error_message = NULL,
                  completed_at = ?,
                  last_modified_at = ?
              WHERE id = ? AND status IN {ACTIVE_SQL}
              RETURNING user_id, media_item_id"
        ))
        .bind(DownloadStatus::Completed.as_str())
        .bind(total_bytes.max(0))
        .bind(total_bytes.max(0))
        .bind(local_file_path)
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };
        let user_id: String = row.get("user_id");
        let media_item_id: String = row.get("media_item_id");

        sqlx::query(
            r"UPDATE media_items
              SET is_downloaded = 1, local_file_path = ?, download_progress = 1.0
              WHERE user_id = ? AND id = ?",
        )
        .bind(local_file_path)
        .bind(&user_id)
        .bind(&media_item_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.notify_downloads(&user_id);
        self.notify_media_items(&user_id);
        Ok(true)
    }

    /// Marks an active download failed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn fail_download(&self, id: &str, message: &str) -> Result<bool> {
        let row = sqlx::query(&format!(
            r"UPDATE downloads
              SET status = ?, error_message = ?, local_file_path = NULL, last_modified_at = ?
              WHERE id = ? AND status IN {ACTIVE_SQL}
              RETURNING user_id"
        ))
        .bind(DownloadStatus::Failed.as_str())
        .bind(message)
        .bind(now_millis())
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(self.finish_conditional_write(row))
    }

    /// Marks every active download run by a scheduler unit failed and returns them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self, message))]
    pub async fn fail_downloads_for_work(
        &self,
        work_id: &str,
        message: &str,
    ) -> Result<Vec<DownloadRecord>> {
        let failed = sqlx::query_as::<_, DownloadRecord>(&format!(
            r"UPDATE downloads
              SET status = ?, error_message = ?, local_file_path = NULL, last_modified_at = ?
              WHERE scheduler_work_id = ? AND status IN {ACTIVE_SQL}
              RETURNING *"
        ))
        .bind(DownloadStatus::Failed.as_str())
        .bind(message)
        .bind(now_millis())
        .bind(work_id)
        .fetch_all(self.db.pool())
        .await?;

        for record in &failed {
            self.notify_downloads(&record.user_id);
        }
        Ok(failed)
    }

    /// Marks an active download cancelled. Terminal rows are left as they are.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn cancel_download(&self, id: &str) -> Result<bool> {
        let row = sqlx::query(&format!(
            r"UPDATE downloads SET status = ?, last_modified_at = ?
              WHERE id = ? AND status IN {ACTIVE_SQL}
              RETURNING user_id"
        ))
        .bind(DownloadStatus::Cancelled.as_str())
        .bind(now_millis())
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(self.finish_conditional_write(row))
    }

    /// Cancels every active download of a user and returns the cancelled rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn cancel_active_for_user(&self, user_id: &str) -> Result<Vec<DownloadRecord>> {
        let cancelled = sqlx::query_as::<_, DownloadRecord>(&format!(
            r"UPDATE downloads SET status = ?, last_modified_at = ?
              WHERE user_id = ? AND status IN {ACTIVE_SQL}
              RETURNING *"
        ))
        .bind(DownloadStatus::Cancelled.as_str())
        .bind(now_millis())
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;

        if !cancelled.is_empty() {
            self.notify_downloads(user_id);
        }
        Ok(cancelled)
    }

    /// Deletes a download row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if the download does not exist.
    #[instrument(skip(self))]
    pub async fn delete_download(&self, id: &str) -> Result<()> {
        let row = sqlx::query(r"DELETE FROM downloads WHERE id = ? RETURNING user_id")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        let Some(row) = row else {
            return check_affected("download", id, 0);
        };
        self.notify_downloads(row.get::<String, _>("user_id").as_str());
        Ok(())
    }

    /// Lists a user's downloads in the given statuses, most recent first.
    ///
    /// An empty status slice lists every status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_downloads(
        &self,
        user_id: &str,
        statuses: &[DownloadStatus],
    ) -> Result<Vec<DownloadRecord>> {
        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT * FROM downloads WHERE user_id = ");
        builder.push_bind(user_id);
        if !statuses.is_empty() {
            builder.push(" AND status IN (");
            let mut separated = builder.separated(", ");
            for status in statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
        builder.push(" ORDER BY started_at DESC, rowid DESC");

        let records = builder
            .build_query_as::<DownloadRecord>()
            .fetch_all(self.db.pool())
            .await?;

        Ok(records)
    }

    /// Lists completed downloads of every user, oldest completion first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn completed_downloads_oldest_first(&self) -> Result<Vec<DownloadRecord>> {
        let records = sqlx::query_as::<_, DownloadRecord>(
            r"SELECT * FROM downloads
              WHERE status = ?
              ORDER BY completed_at ASC, started_at ASC, rowid ASC",
        )
        .bind(DownloadStatus::Completed.as_str())
        .fetch_all(self.db.pool())
        .await?;

        Ok(records)
    }

    /// Counts a user's downloads per status with their byte totals.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn download_totals(&self, user_id: &str) -> Result<Vec<StatusTotals>> {
        let totals = sqlx::query_as::<_, StatusTotals>(
            r"SELECT status, COUNT(*) AS count, COALESCE(SUM(downloaded_bytes), 0) AS bytes
              FROM downloads
              WHERE user_id = ?
              GROUP BY status",
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(totals)
    }

    fn finish_conditional_write(&self, row: Option<sqlx::sqlite::SqliteRow>) -> bool {
        match row {
            Some(row) => {
                self.notify_downloads(row.get::<String, _>("user_id").as_str());
                true
            }
            None => false,
        }
    }
}

/// Maps an insert failure caused by the single-active-download index.
pub(crate) fn is_duplicate_active(error: &StoreError) -> bool {
    error.is_constraint_violation()
}
