//! Offline Cache Core Library
//!
//! This library keeps a rolling set of downloaded videos on a
//! storage-constrained device so playback continues offline.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - Database connection and schema management
//! - [`store`] - Media item and download records with reactive queries
//! - [`storage`] - Free space reporting for the download directory
//! - [`catalog`] - Remote content catalog client and client registry
//! - [`session`] - Current signed-in user
//! - [`scheduler`] - Durable background work queue with a worker pool
//! - [`transfer`] - Byte transfer worker invoked by the scheduler
//! - [`orchestrator`] - Download request surface (start, cancel, retry, delete)
//! - [`sync`] - Periodic reconciliation of the offline cache

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod db;
pub mod orchestrator;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod store;
pub mod sync;
pub mod transfer;

mod time;

// Re-export commonly used types
pub use catalog::{
    CatalogError, CatalogItem, CatalogPage, CatalogRegistry, ContentCatalog, HttpCatalog,
};
pub use db::{Database, DatabaseOptions, DbError};
pub use orchestrator::{
    DownloadOrchestrator, DownloadStatistics, OrchestratorError, estimate_download_bytes,
};
pub use scheduler::{
    DeviceConditions, DurableScheduler, HostConditions, NetworkStatus, NetworkType, PoolSettings,
    PoolStats, RetryPolicy, SchedulerError, TaskScheduler, WorkConstraints, WorkContext,
    WorkHandle, WorkOutcome, WorkRequest, WorkState, Worker, WorkerPool,
};
pub use session::{SessionProvider, StaticSession};
pub use storage::{FsStorageAdvisor, StorageAdvisor, StorageError};
pub use store::{
    DownloadRecord, DownloadRepository, DownloadStatus, MediaItemRecord, MediaItemUpsert,
    NewDownload, RecordStore, StoreChange, StoreError,
};
pub use sync::{ReconcilerSettings, SyncError, SyncPhase, SyncReconciler, SyncReport, SyncWorker};
pub use transfer::{DownloadPaths, FailureType, TransferError, TransferWorker};
