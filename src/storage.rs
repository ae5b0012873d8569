//! Free-space reporting for the download directory.
//!
//! The [`StorageAdvisor`] trait is the single source of the storage signal used
//! by admission checks ([`crate::DownloadOrchestrator::start`]), scheduler
//! constraints, and cache eviction. [`FsStorageAdvisor`] answers from the
//! filesystem holding the download directory.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Default low-storage threshold (1 GiB).
pub const DEFAULT_LOW_STORAGE_THRESHOLD_BYTES: u64 = 1024 * 1024 * 1024;

/// Errors raised while querying free space.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The filesystem query failed.
    #[error("failed to query free space for {path}: {source}")]
    Query {
        /// Directory that was queried.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Reports free bytes and low-storage state.
pub trait StorageAdvisor: Send + Sync {
    /// Bytes available to the download directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the underlying query fails.
    fn free_bytes(&self) -> Result<u64, StorageError>;

    /// True when the device is under storage pressure.
    fn is_low(&self) -> bool;

    /// True when `bytes` fit in the currently free space.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the underlying query fails.
    fn has_space_for(&self, bytes: u64) -> Result<bool, StorageError> {
        Ok(self.free_bytes()? >= bytes)
    }
}

/// Storage advisor backed by the filesystem of a directory.
#[derive(Debug, Clone)]
pub struct FsStorageAdvisor {
    dir: PathBuf,
    low_threshold_bytes: u64,
}

impl FsStorageAdvisor {
    /// Creates an advisor for `dir` that reports low storage below `low_threshold_bytes`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, low_threshold_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            low_threshold_bytes,
        }
    }

    /// Directory whose filesystem is measured.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Low-storage threshold in bytes.
    #[must_use]
    pub fn low_threshold_bytes(&self) -> u64 {
        self.low_threshold_bytes
    }
}

impl StorageAdvisor for FsStorageAdvisor {
    fn free_bytes(&self) -> Result<u64, StorageError> {
        let free = fs2::available_space(&self.dir).map_err(|source| StorageError::Query {
            path: self.dir.clone(),
            source,
        })?;
        debug!(dir = %self.dir.display(), free, "queried free space");
        Ok(free)
    }

    fn is_low(&self) -> bool {
        match self.free_bytes() {
            Ok(free) => free < self.low_threshold_bytes,
            Err(error) => {
                // An unreadable filesystem is treated as full.
                warn!(error = %error, "free space query failed, reporting low storage");
                true
            }
        }
    }
}
