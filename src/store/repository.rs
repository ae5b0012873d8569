//! Repository seam for the writes a transfer performs.
//!
//! The transfer worker depends on this trait rather than on [`RecordStore`]
//! directly, so a transfer can be exercised against any store that honors the
//! conditional-write contract: progress and terminal writes only apply while
//! the download is still pending or downloading.

use async_trait::async_trait;

use super::{DownloadRecord, RecordStore, Result};

/// Data-access contract for transfer progress and terminal state.
#[async_trait]
pub trait DownloadRepository: Send + Sync {
    /// Reads a download by id.
    async fn get_download(&self, id: &str) -> Result<Option<DownloadRecord>>;

    /// Finds the user's download of a media item, preferring an active one.
    async fn find_download_for_media(
        &self,
        user_id: &str,
        media_item_id: &str,
    ) -> Result<Option<DownloadRecord>>;

    /// Records monotone progress; `false` when the download is no longer active.
    async fn record_progress(
        &self,
        id: &str,
        downloaded_bytes: i64,
        total_bytes: i64,
        progress: f64,
    ) -> Result<bool>;

    /// Records a retryable error without leaving the active state.
    async fn record_transient_error(&self, id: &str, message: &str) -> Result<bool>;

    /// Completes the download and marks its media item downloaded.
    async fn complete_download(
        &self,
        id: &str,
        local_file_path: &str,
        total_bytes: i64,
    ) -> Result<bool>;

    /// Marks the download failed.
    async fn fail_download(&self, id: &str, message: &str) -> Result<bool>;

    /// Marks the active downloads run by a scheduler unit failed.
    async fn fail_downloads_for_work(
        &self,
        work_id: &str,
        message: &str,
    ) -> Result<Vec<DownloadRecord>>;
}

#[async_trait]
impl DownloadRepository for RecordStore {
    async fn get_download(&self, id: &str) -> Result<Option<DownloadRecord>> {
        RecordStore::get_download(self, id).await
    }

    async fn find_download_for_media(
        &self,
        user_id: &str,
        media_item_id: &str,
    ) -> Result<Option<DownloadRecord>> {
        RecordStore::find_download_for_media(self, user_id, media_item_id).await
    }

    async fn record_progress(
        &self,
        id: &str,
        downloaded_bytes: i64,
        total_bytes: i64,
        progress: f64,
    ) -> Result<bool> {
        RecordStore::record_progress(self, id, downloaded_bytes, total_bytes, progress).await
    }

    async fn record_transient_error(&self, id: &str, message: &str) -> Result<bool> {
        RecordStore::record_transient_error(self, id, message).await
    }

    async fn complete_download(
        &self,
        id: &str,
        local_file_path: &str,
        total_bytes: i64,
    ) -> Result<bool> {
        RecordStore::complete_download(self, id, local_file_path, total_bytes).await
    }

    async fn fail_download(&self, id: &str, message: &str) -> Result<bool> {
        RecordStore::fail_download(self, id, message).await
    }

    async fn fail_downloads_for_work(
        &self,
        work_id: &str,
        message: &str,
    ) -> Result<Vec<DownloadRecord>> {
        RecordStore::fail_downloads_for_work(self, work_id, message).await
    }
}
