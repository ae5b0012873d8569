//! Errors returned by the download orchestrator.

use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::SchedulerError;
use crate::storage::StorageError;
use crate::store::{DownloadStatus, StoreError};

/// Why a download request was refused or could not be carried out.
///
/// The first six variants are request/state errors and are never retried
/// automatically; the wrapped variants are I/O failures the caller may retry.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No user is signed in.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The download or media item does not exist for the current user.
    #[error("not found: {0}")]
    NotFound(String),

    /// The item already has a completed download.
    #[error("media item {0} is already downloaded")]
    AlreadyDownloaded(String),

    /// The item already has a pending or running download.
    #[error("a download for media item {0} is already in progress")]
    InProgress(String),

    /// Free space is below the estimated size.
    #[error("insufficient storage: need {required_bytes} bytes, {available_bytes} available")]
    InsufficientStorage {
        required_bytes: u64,
        available_bytes: u64,
    },

    /// `retry` was called on a download that has not failed.
    #[error("download {id} is {status}, only failed downloads can be retried")]
    NotInFailedState { id: String, status: DownloadStatus },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Removing a downloaded file failed.
    #[error("failed to remove {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OrchestratorError {
    /// True for request/state errors that retrying the same call cannot fix.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NotAuthenticated
                | Self::NotFound(_)
                | Self::AlreadyDownloaded(_)
                | Self::InProgress(_)
                | Self::InsufficientStorage { .. }
                | Self::NotInFailedState { .. }
        )
    }
}
