//! The scheduler worker that moves bytes for one download.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE, RETRY_AFTER};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::failure::retry_after_of;
use super::paths::remove_if_exists;
use super::{DownloadPaths, TRANSFER_WORKER, TransferError, TransferPayload, classify_error};
use crate::catalog::ContentCatalog;
use crate::scheduler::{WorkContext, WorkOutcome, Worker};
use crate::store::{DownloadRecord, DownloadRepository, StoreError};

/// Transfer connect timeout.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Maximum idle time between body reads.
const READ_TIMEOUT_SECS: u64 = 60;

/// Progress is reported whenever another MiB has been written...
const PROGRESS_BYTES_STEP: u64 = 1024 * 1024;

/// ...or the fraction grew by at least one percent.
const PROGRESS_FRACTION_STEP: f64 = 0.01;

/// How a single transfer attempt ended without error.
#[derive(Debug)]
enum TransferEnd {
    Finished { path: PathBuf, bytes: u64 },
    Cancelled,
}

/// Streams videos for admitted downloads.
pub struct TransferWorker {
    repository: Arc<dyn DownloadRepository>,
    catalog: Arc<dyn ContentCatalog>,
    paths: DownloadPaths,
    client: Client,
}

impl TransferWorker {
    /// Creates a worker writing into `paths`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Client`] if the HTTP client cannot be built.
    pub fn new(
        repository: Arc<dyn DownloadRepository>,
        catalog: Arc<dyn ContentCatalog>,
        paths: DownloadPaths,
    ) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .read_timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .user_agent(concat!("offline-cache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(TransferError::Client)?;

        Ok(Self {
            repository,
            catalog,
            paths,
            client,
        })
    }

    #[must_use]
    pub fn paths(&self) -> &DownloadPaths {
        &self.paths
    }

    /// The active download this unit should transfer.
    ///
    /// Falls back to a superseding active download of the same item when the
    /// unit's own record is gone or terminal.
    async fn resolve_record(
        &self,
        payload: &TransferPayload,
    ) -> Result<Option<DownloadRecord>, StoreError> {
        if let Some(record) = self.repository.get_download(&payload.download_id).await?
            && record.status().is_active()
        {
            return Ok(Some(record));
        }
        let current = self
            .repository
            .find_download_for_media(&payload.user_id, &payload.media_item_id)
            .await?;
        Ok(current.filter(|record| record.status().is_active()))
    }

    async fn transfer(
        &self,
        record: &DownloadRecord,
        cancellation: &CancellationToken,
    ) -> Result<TransferEnd, TransferError> {
        let url = self.catalog.stream_url(&record.media_item_id)?;
        let url_str = url.to_string();
        let partial = self
            .paths
            .partial_path(&record.user_id, &record.media_item_id);
        self.paths.ensure_user_dir(&record.user_id).await?;

        let existing = tokio::fs::metadata(&partial)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);

        let mut request = self.client.get(url);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={existing}-"));
        }

        let response = tokio::select! {
            biased;
            () = cancellation.cancelled() => return Ok(TransferEnd::Cancelled),
            response = request.send() => {
                response.map_err(|e| TransferError::from_reqwest(&url_str, e))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            if status.as_u16() == 416 {
                // The partial file no longer matches the remote video.
                remove_if_exists(&partial).await?;
            }
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            return Err(TransferError::http_status(
                &url_str,
                status.as_u16(),
                retry_after,
            ));
        }

        let resumed = existing > 0 && status.as_u16() == 206;
        let mut downloaded = if resumed { existing } else { 0 };
        let content_length = derive_total_content_length(&response, downloaded);
        let total =
            content_length.unwrap_or_else(|| u64::try_from(record.total_bytes).unwrap_or(0));
        debug!(resumed, from = downloaded, total, "transfer response accepted");

        let file = open_partial(&partial, resumed).await?;
        let mut writer = BufWriter::new(file);
        let mut progress = ProgressGate::new(downloaded, total);

        // First report moves the record from pending to downloading.
        if !self.report(record, downloaded, total).await? {
            return Ok(TransferEnd::Cancelled);
        }

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                () = cancellation.cancelled() => {
                    drop(writer);
                    return Ok(TransferEnd::Cancelled);
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| TransferError::from_reqwest(&url_str, e))?;

            writer
                .write_all(&chunk)
                .await
                .map_err(|e| TransferError::io(partial.clone(), e))?;
            downloaded += chunk.len() as u64;

            if progress.should_report(downloaded)
                && !self.report(record, downloaded, total).await?
            {
                return Ok(TransferEnd::Cancelled);
            }
        }

        writer
            .flush()
            .await
            .map_err(|e| TransferError::io(partial.clone(), e))?;
        drop(writer);

        if let Some(expected) = content_length
            && expected != downloaded
        {
            return Err(TransferError::Integrity {
                path: partial,
                expected_bytes: expected,
                actual_bytes: downloaded,
            });
        }

        let final_path = self
            .paths
            .final_path(&record.user_id, &record.media_item_id);
        tokio::fs::rename(&partial, &final_path)
            .await
            .map_err(|e| TransferError::io(final_path.clone(), e))?;

        Ok(TransferEnd::Finished {
            path: final_path,
            bytes: downloaded,
        })
    }

    /// Writes progress; `false` means the record left the active states.
    async fn report(
        &self,
        record: &DownloadRecord,
        downloaded: u64,
        total: u64,
    ) -> Result<bool, TransferError> {
        let written = self
            .repository
            .record_progress(
                &record.id,
                to_i64(downloaded),
                to_i64(total),
                fraction(downloaded, total),
            )
            .await?;
        Ok(written)
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = remove_if_exists(path).await {
            warn!(path = %path.display(), error = %e, "failed to remove transfer file");
        }
    }

    async fn discard_partial(&self, record: &DownloadRecord) {
        self.discard(
            &self
                .paths
                .partial_path(&record.user_id, &record.media_item_id),
        )
        .await;
    }

    async fn handle_failure(
        &self,
        ctx: &WorkContext,
        record: &DownloadRecord,
        error: &TransferError,
    ) -> WorkOutcome {
        let message = error.to_string();
        let failure = classify_error(error);

        if failure.is_retryable() && !ctx.is_final_attempt() {
            info!(
                error = %message,
                ?failure,
                attempt = ctx.attempt,
                "transfer will be retried"
            );
            if let Err(e) = self
                .repository
                .record_transient_error(&record.id, &message)
                .await
            {
                warn!(error = %e, "failed to record transient transfer error");
            }
            return WorkOutcome::Retry {
                message,
                after: retry_after_of(error),
            };
        }

        warn!(error = %message, ?failure, attempt = ctx.attempt, "transfer failed");
        match self.repository.fail_download(&record.id, &message).await {
            Ok(true) => {
                self.discard_partial(record).await;
            }
            Ok(false) => debug!("download left the active states before failing"),
            Err(e) => {
                // Without the terminal write the unit must run again.
                warn!(error = %e, "failed to mark download failed");
                return WorkOutcome::retry(e.to_string());
            }
        }
        WorkOutcome::Failure { message }
    }
}

#[async_trait]
impl Worker for TransferWorker {
    fn kind(&self) -> &'static str {
        TRANSFER_WORKER
    }

    #[instrument(skip(self, ctx), fields(work_id = %ctx.handle, attempt = ctx.attempt))]
    async fn execute(&self, ctx: &WorkContext) -> WorkOutcome {
        let payload: TransferPayload = match ctx.payload_as() {
            Ok(payload) => payload,
            Err(e) => return WorkOutcome::failure(format!("invalid transfer payload: {e}")),
        };

        let record = match self.resolve_record(&payload).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(download_id = %payload.download_id, "no active download, nothing to do");
                return WorkOutcome::Success;
            }
            Err(e) => return WorkOutcome::retry(e.to_string()),
        };

        info!(
            download_id = %record.id,
            media_item_id = %record.media_item_id,
            "starting transfer"
        );
        match self.transfer(&record, &ctx.cancellation).await {
            Ok(TransferEnd::Finished { path, bytes }) => {
                let path_str = path.to_string_lossy();
                match self
                    .repository
                    .complete_download(&record.id, &path_str, to_i64(bytes))
                    .await
                {
                    Ok(true) => {
                        info!(
                            download_id = %record.id,
                            path = %path.display(),
                            bytes,
                            "download complete"
                        );
                        WorkOutcome::Success
                    }
                    Ok(false) => {
                        // Cancelled after the last chunk; the file has no owner.
                        debug!(
                            download_id = %record.id,
                            "download no longer active, removing file"
                        );
                        self.discard(&path).await;
                        WorkOutcome::Success
                    }
                    Err(e) => {
                        self.handle_failure(ctx, &record, &TransferError::Store(e))
                            .await
                    }
                }
            }
            Ok(TransferEnd::Cancelled) => {
                info!(download_id = %record.id, "transfer cancelled");
                self.discard_partial(&record).await;
                WorkOutcome::Success
            }
            Err(error) => self.handle_failure(ctx, &record, &error).await,
        }
    }

    /// Fails whatever download the unit still holds active, so a panic or an
    /// unrecorded final error never strands a record in the active states.
    async fn on_failed(&self, ctx: &WorkContext, message: &str) {
        let failed = match self
            .repository
            .fail_downloads_for_work(ctx.handle.as_str(), message)
            .await
        {
            Ok(failed) => failed,
            Err(e) => {
                warn!(work_id = %ctx.handle, error = %e, "failed to mark downloads of failed unit");
                return;
            }
        };
        for record in failed {
            warn!(download_id = %record.id, error = %message, "download failed with its work unit");
            self.discard_partial(&record).await;
        }
    }
}

/// Decides when another progress write is due.
#[derive(Debug)]
struct ProgressGate {
    total: u64,
    last_bytes: u64,
    last_fraction: f64,
}

impl ProgressGate {
    fn new(start: u64, total: u64) -> Self {
        Self {
            total,
            last_bytes: start,
            last_fraction: fraction(start, total),
        }
    }

    fn should_report(&mut self, downloaded: u64) -> bool {
        let current = fraction(downloaded, self.total);
        let crossed_mib = downloaded / PROGRESS_BYTES_STEP > self.last_bytes / PROGRESS_BYTES_STEP;
        let grew = current - self.last_fraction >= PROGRESS_FRACTION_STEP;
        if crossed_mib || grew {
            self.last_bytes = downloaded;
            self.last_fraction = current;
            true
        } else {
            false
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn fraction(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (downloaded as f64 / total as f64).clamp(0.0, 1.0)
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

async fn open_partial(path: &Path, append: bool) -> Result<File, TransferError> {
    let file = if append {
        OpenOptions::new().append(true).open(path).await
    } else {
        File::create(path).await
    };
    file.map_err(|e| TransferError::io(path, e))
}

/// Full size of the video, accounting for a ranged response.
fn derive_total_content_length(response: &reqwest::Response, existing_bytes: u64) -> Option<u64> {
    let current = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if response.status().as_u16() == 206 {
        current.map(|remaining| existing_bytes.saturating_add(remaining))
    } else {
        current
    }
}
