//! Download request surface.
//!
//! [`DownloadOrchestrator`] admits, cancels, retries, and deletes downloads for
//! the signed-in user. Admission enforces the single-active-download rule and
//! a free-space check against [`estimate_download_bytes`] before handing the
//! transfer to the [`TaskScheduler`].
//!
//! # Example
//!
//! ```ignore
//! let orchestrator = DownloadOrchestrator::new(store, scheduler, storage, session, paths);
//! let id = orchestrator.start("item-1", true).await?;
//! orchestrator.cancel(&id).await?;
//! ```

mod error;

pub use error::OrchestratorError;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::scheduler::{NetworkType, TaskScheduler, WorkConstraints, WorkHandle, WorkRequest};
use crate::session::SessionProvider;
use crate::storage::StorageAdvisor;
use crate::store::{
    DownloadRecord, DownloadStatus, NewDownload, RecordStore, StoreError, TICKS_PER_SECOND,
};
use crate::transfer::{DownloadPaths, TRANSFER_WORKER, TransferPayload};

/// Tag carried by every transfer unit.
pub const DOWNLOAD_TAG: &str = "download";

/// Size estimate per minute of video: 2 Mbit/s.
pub const ESTIMATED_BYTES_PER_MINUTE: u64 = 15_000_000;

const TICKS_PER_MINUTE: u64 = 60 * TICKS_PER_SECOND.unsigned_abs();

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Estimated file size for a video of `duration_ticks` (100 ns units).
///
/// Minutes are rounded up and at least one minute is assumed, so the
/// estimate is never zero.
#[must_use]
pub fn estimate_download_bytes(duration_ticks: i64) -> u64 {
    let ticks = u64::try_from(duration_ticks).unwrap_or(0);
    let minutes = ticks.div_ceil(TICKS_PER_MINUTE).max(1);
    minutes.saturating_mul(ESTIMATED_BYTES_PER_MINUTE)
}

/// Unique scheduler key for an item's transfer.
#[must_use]
pub fn download_work_key(media_item_id: &str) -> String {
    format!("{DOWNLOAD_TAG}_{media_item_id}")
}

/// Aggregate download figures for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStatistics {
    pub pending: u64,
    pub downloading: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Bytes on disk for completed downloads.
    pub completed_bytes: u64,
    /// Total duration of downloaded media items.
    pub downloaded_duration_secs: u64,
}

impl DownloadStatistics {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.pending + self.downloading + self.completed + self.failed + self.cancelled
    }

    #[must_use]
    pub fn active(&self) -> u64 {
        self.pending + self.downloading
    }
}

/// Public surface for starting and managing downloads.
pub struct DownloadOrchestrator {
    store: RecordStore,
    scheduler: Arc<dyn TaskScheduler>,
    storage: Arc<dyn StorageAdvisor>,
    session: Arc<dyn SessionProvider>,
    paths: DownloadPaths,
}

impl DownloadOrchestrator {
    #[must_use]
    pub fn new(
        store: RecordStore,
        scheduler: Arc<dyn TaskScheduler>,
        storage: Arc<dyn StorageAdvisor>,
        session: Arc<dyn SessionProvider>,
        paths: DownloadPaths,
    ) -> Self {
        Self {
            store,
            scheduler,
            storage,
            session,
            paths,
        }
    }

    #[must_use]
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    fn current_user(&self) -> Result<String> {
        self.session
            .current_user_id()
            .ok_or(OrchestratorError::NotAuthenticated)
    }

    /// Admits a download of `media_item_id` for the current user.
    ///
    /// A failed or cancelled earlier attempt is replaced. With `wifi_only` the
    /// transfer waits for an unmetered network.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated`, `AlreadyDownloaded`, `InProgress`, `NotFound`,
    /// `InsufficientStorage`, or a wrapped store/scheduler/storage failure.
    #[instrument(skip(self))]
    pub async fn start(&self, media_item_id: &str, wifi_only: bool) -> Result<String> {
        let user_id = self.current_user()?;
        self.start_for(&user_id, media_item_id, wifi_only).await
    }

    async fn start_for(
        &self,
        user_id: &str,
        media_item_id: &str,
        wifi_only: bool,
    ) -> Result<String> {
        while let Some(existing) = self
            .store
            .find_download_for_media(user_id, media_item_id)
            .await?
        {
            match existing.status() {
                DownloadStatus::Completed => {
                    return Err(OrchestratorError::AlreadyDownloaded(media_item_id.to_string()));
                }
                DownloadStatus::Pending | DownloadStatus::Downloading => {
                    return Err(OrchestratorError::InProgress(media_item_id.to_string()));
                }
                DownloadStatus::Failed | DownloadStatus::Cancelled => {
                    debug!(
                        download_id = %existing.id,
                        status = %existing.status(),
                        "superseding earlier attempt"
                    );
                    remove_record(&self.store, &existing.id).await?;
                }
            }
        }

        let media = self
            .store
            .get_media_item(user_id, media_item_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("media item {media_item_id}")))?;

        let required_bytes = estimate_download_bytes(media.duration_ticks);
        let available_bytes = self.storage.free_bytes()?;
        if available_bytes < required_bytes {
            info!(
                required_bytes,
                available_bytes, "refusing download, not enough space"
            );
            return Err(OrchestratorError::InsufficientStorage {
                required_bytes,
                available_bytes,
            });
        }

        let download_id = uuid::Uuid::new_v4().to_string();
        let inserted = self
            .store
            .insert_download(&NewDownload {
                id: &download_id,
                media_item_id,
                user_id,
                total_bytes: i64::try_from(required_bytes).unwrap_or(i64::MAX),
                wifi_only,
            })
            .await;
        match inserted {
            Ok(_) => {}
            // A concurrent start won the single-active-download index.
            Err(e) if crate::store::is_duplicate_active(&e) => {
                return Err(OrchestratorError::InProgress(media_item_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let handle = match self.submit(&download_id, user_id, media_item_id, wifi_only).await {
            Ok(handle) => handle,
            Err(e) => {
                // Never leave an admitted record without a unit to run it.
                remove_record(&self.store, &download_id).await?;
                return Err(e);
            }
        };
        self.store
            .set_scheduler_work_id(&download_id, handle.as_str())
            .await?;

        info!(
            download_id,
            media_item_id,
            wifi_only,
            work_id = %handle,
            "download admitted"
        );
        Ok(download_id)
    }

    async fn submit(
        &self,
        download_id: &str,
        user_id: &str,
        media_item_id: &str,
        wifi_only: bool,
    ) -> Result<WorkHandle> {
        let payload = serde_json::to_value(TransferPayload {
            download_id: download_id.to_string(),
            user_id: user_id.to_string(),
            media_item_id: media_item_id.to_string(),
        })
        .map_err(crate::scheduler::SchedulerError::from)?;

        let key = download_work_key(media_item_id);
        let request = WorkRequest::new(TRANSFER_WORKER, key.clone())
            .tag(DOWNLOAD_TAG)
            .tag(key)
            .constraints(WorkConstraints {
                network: if wifi_only {
                    NetworkType::Unmetered
                } else {
                    NetworkType::Connected
                },
                battery_not_low: true,
                storage_not_low: true,
            })
            .payload(payload);

        Ok(self.scheduler.enqueue_unique(request).await?)
    }

    /// Cancels a download. Cancelling a finished download succeeds without change.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated`, `NotFound`, or a wrapped store/scheduler failure.
    #[instrument(skip(self))]
    pub async fn cancel(&self, download_id: &str) -> Result<()> {
        let user_id = self.current_user()?;
        let record = self.owned_record(&user_id, download_id).await?;
        self.cancel_record(&record).await
    }

    /// Cancels the current user's download of `media_item_id`.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated`, `NotFound`, or a wrapped store/scheduler failure.
    #[instrument(skip(self))]
    pub async fn cancel_by_media_item(&self, media_item_id: &str) -> Result<()> {
        let user_id = self.current_user()?;
        let record = self
            .store
            .find_download_for_media(&user_id, media_item_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("download of {media_item_id}")))?;
        self.cancel_record(&record).await
    }

    async fn cancel_record(&self, record: &DownloadRecord) -> Result<()> {
        if record.status().is_terminal() {
            debug!(
                download_id = %record.id,
                status = %record.status(),
                "cancel on finished download is a no-op"
            );
            return Ok(());
        }

        if let Some(work_id) = &record.scheduler_work_id {
            self.scheduler
                .cancel(&WorkHandle::from(work_id.as_str()))
                .await?;
        }
        if self.store.cancel_download(&record.id).await? {
            info!(download_id = %record.id, "download cancelled");
        }
        self.discard_partial(record).await;
        Ok(())
    }

    /// Cancels every transfer unit and every active download of the current user.
    ///
    /// Returns the number of downloads cancelled.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated`, or a wrapped store/scheduler failure.
    #[instrument(skip(self))]
    pub async fn cancel_all(&self) -> Result<u64> {
        let user_id = self.current_user()?;
        let units = self.scheduler.cancel_by_tag(DOWNLOAD_TAG).await?;
        let cancelled = self.store.cancel_active_for_user(&user_id).await?;
        for record in &cancelled {
            self.discard_partial(record).await;
        }
        info!(units, downloads = cancelled.len(), "cancelled all downloads");
        Ok(cancelled.len() as u64)
    }

    /// Replaces a failed download with a fresh attempt.
    ///
    /// # Errors
    ///
    /// `NotInFailedState` unless the download failed, plus every error of [`Self::start`].
    #[instrument(skip(self))]
    pub async fn retry(&self, download_id: &str) -> Result<String> {
        let user_id = self.current_user()?;
        let record = self.owned_record(&user_id, download_id).await?;
        if record.status() != DownloadStatus::Failed {
            return Err(OrchestratorError::NotInFailedState {
                status: record.status(),
                id: record.id,
            });
        }

        remove_record(&self.store, &record.id).await?;
        self.start_for(&user_id, &record.media_item_id, record.wifi_only)
            .await
    }

    /// Deletes a download, its file, and the item's downloaded flag.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated`, `NotFound`, `Io` if the file cannot be removed, or a
    /// wrapped store/scheduler failure.
    #[instrument(skip(self))]
    pub async fn delete(&self, download_id: &str) -> Result<()> {
        let user_id = self.current_user()?;
        let record = self.owned_record(&user_id, download_id).await?;
        self.evict(&record).await
    }

    /// Deletes `record` regardless of the signed-in user.
    ///
    /// Used by cache maintenance, which works across users.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be removed, or a wrapped store/scheduler failure.
    pub async fn evict(&self, record: &DownloadRecord) -> Result<()> {
        if record.status().is_active()
            && let Some(work_id) = &record.scheduler_work_id
        {
            self.scheduler
                .cancel(&WorkHandle::from(work_id.as_str()))
                .await?;
        }

        if let Some(path) = &record.local_file_path {
            remove_file(Path::new(path)).await?;
        }
        self.discard_partial(record).await;

        self.store
            .clear_media_download(&record.user_id, &record.media_item_id)
            .await?;
        remove_record(&self.store, &record.id).await?;
        info!(
            download_id = %record.id,
            media_item_id = %record.media_item_id,
            "download deleted"
        );
        Ok(())
    }

    /// Reads one of the current user's downloads.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` or a wrapped store failure.
    pub async fn get(&self, download_id: &str) -> Result<Option<DownloadRecord>> {
        let user_id = self.current_user()?;
        let record = self.store.get_download(download_id).await?;
        Ok(record.filter(|record| record.user_id == user_id))
    }

    /// Reads the current user's download of a media item.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` or a wrapped store failure.
    pub async fn get_by_media_item(&self, media_item_id: &str) -> Result<Option<DownloadRecord>> {
        let user_id = self.current_user()?;
        Ok(self
            .store
            .find_download_for_media(&user_id, media_item_id)
            .await?)
    }

    /// Lists every download of the current user, newest first.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` or a wrapped store failure.
    pub async fn list_downloads(&self) -> Result<Vec<DownloadRecord>> {
        let user_id = self.current_user()?;
        Ok(self.store.list_downloads(&user_id, &[]).await?)
    }

    /// Live list of the current user's pending and downloading downloads.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` or a wrapped store failure.
    pub async fn watch_active(&self) -> Result<watch::Receiver<Vec<DownloadRecord>>> {
        let user_id = self.current_user()?;
        Ok(self
            .store
            .watch_downloads(&user_id, &DownloadStatus::ACTIVE)
            .await?)
    }

    /// Live list of the current user's completed downloads.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` or a wrapped store failure.
    pub async fn watch_completed(&self) -> Result<watch::Receiver<Vec<DownloadRecord>>> {
        let user_id = self.current_user()?;
        Ok(self
            .store
            .watch_downloads(&user_id, &[DownloadStatus::Completed])
            .await?)
    }

    /// Counts by status, completed bytes, and downloaded duration for the current user.
    ///
    /// # Errors
    ///
    /// `NotAuthenticated` or a wrapped store failure.
    #[instrument(skip(self))]
    pub async fn statistics(&self) -> Result<DownloadStatistics> {
        let user_id = self.current_user()?;
        let mut stats = DownloadStatistics::default();

        for totals in self.store.download_totals(&user_id).await? {
            let count = u64::try_from(totals.count).unwrap_or(0);
            let Ok(status) = totals.status_str.parse::<DownloadStatus>() else {
                warn!(status = %totals.status_str, "skipping unknown download status");
                continue;
            };
            match status {
                DownloadStatus::Pending => stats.pending = count,
                DownloadStatus::Downloading => stats.downloading = count,
                DownloadStatus::Completed => {
                    stats.completed = count;
                    stats.completed_bytes = u64::try_from(totals.bytes).unwrap_or(0);
                }
                DownloadStatus::Failed => stats.failed = count,
                DownloadStatus::Cancelled => stats.cancelled = count,
            }
        }

        stats.downloaded_duration_secs = self
            .store
            .downloaded_media_items(&user_id)
            .await?
            .iter()
            .map(|item| u64::try_from(item.duration_seconds()).unwrap_or(0))
            .sum();
        Ok(stats)
    }

    async fn owned_record(&self, user_id: &str, download_id: &str) -> Result<DownloadRecord> {
        self.store
            .get_download(download_id)
            .await?
            .filter(|record| record.user_id == user_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("download {download_id}")))
    }

    /// Best-effort removal of a download's partial file.
    async fn discard_partial(&self, record: &DownloadRecord) {
        let path = self
            .paths
            .partial_path(&record.user_id, &record.media_item_id);
        if let Err(e) = remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "failed to remove partial file");
        }
    }
}

/// Deletes a record, tolerating a concurrent delete.
async fn remove_record(store: &RecordStore, download_id: &str) -> Result<()> {
    match store.delete_download(download_id).await {
        Ok(()) | Err(StoreError::RecordNotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(OrchestratorError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
