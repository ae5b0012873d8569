//! Periodic maintenance of the offline cache.
//!
//! A [`SyncReconciler`] run has three ordered phases:
//!
//! 1. **Catalog refresh** - re-fetch the signed-in user's catalog and upsert
//!    media items. Failures leave stale local data in place.
//! 2. **Eviction** - walk completed downloads of every user, oldest first, and
//!    delete those whose item is gone, that are watched, or while storage is
//!    low. Eviction stops as soon as low storage clears.
//! 3. **Acquisition** - unless storage is low, queue the newest unwatched items
//!    until the target duration of unwatched offline content is reached.
//!
//! Each phase is isolated: its error is logged and recorded in the
//! [`SyncReport`], and later phases still run.

mod reconciler;
mod worker;

pub use reconciler::SyncReconciler;
pub use worker::{SYNC_TAG, SYNC_UNIQUE_KEY, SYNC_WORKER, SyncWorker, sync_request};

use std::fmt;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::orchestrator::OrchestratorError;
use crate::storage::StorageError;
use crate::store::StoreError;

/// Default target of downloaded, largely unwatched content (90 minutes).
const DEFAULT_TARGET_DURATION_SECS: u64 = 5400;

/// Default cap on downloads queued by one run.
const DEFAULT_MAX_NEW_PER_RUN: usize = 10;

/// Default catalog page size.
const DEFAULT_CATALOG_PAGE_SIZE: u32 = 50;

/// Default number of catalog pages fetched per refresh.
const DEFAULT_MAX_CATALOG_PAGES: u32 = 4;

/// Reconciler tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub target_duration_secs: u64,
    pub max_new_per_run: usize,
    pub catalog_page_size: u32,
    pub max_catalog_pages: u32,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            target_duration_secs: DEFAULT_TARGET_DURATION_SECS,
            max_new_per_run: DEFAULT_MAX_NEW_PER_RUN,
            catalog_page_size: DEFAULT_CATALOG_PAGE_SIZE,
            max_catalog_pages: DEFAULT_MAX_CATALOG_PAGES,
        }
    }
}

/// One of the three reconciler phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    CatalogRefresh,
    Eviction,
    Acquisition,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CatalogRefresh => "catalog refresh",
            Self::Eviction => "eviction",
            Self::Acquisition => "acquisition",
        })
    }
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Media items upserted from the catalog.
    pub refreshed: usize,
    /// Completed downloads deleted.
    pub evicted: usize,
    /// New downloads started.
    pub queued: usize,
    /// Phases that failed, with their error.
    pub phase_errors: Vec<(SyncPhase, String)>,
}

impl SyncReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.phase_errors.is_empty()
    }

    fn record_error(&mut self, phase: SyncPhase, error: &SyncError) {
        self.phase_errors.push((phase, error.to_string()));
    }
}

/// Errors raised inside a phase, plus the one failure that escapes a run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A phase panicked; the run is worth retrying.
    #[error("{phase} phase panicked")]
    PhasePanicked { phase: SyncPhase },
}
