//! Durable background work queue.
//!
//! Work units are persisted in the `work_units` table so that queued and
//! interrupted work survives restarts. The [`TaskScheduler`] trait is the
//! surface callers use to enqueue, cancel, and observe units;
//! [`DurableScheduler`] implements it over `SQLite`, and [`WorkerPool`]
//! executes due units with registered [`Worker`]s.
//!
//! # Lifecycle
//!
//! ```text
//! enqueued → running → succeeded
//!    ↑          │  └──→ failed
//!    └─(retry)──┘
//! enqueued | running → cancelled
//! ```
//!
//! At most one `enqueued`/`running` unit exists per unique key; enqueueing a
//! key that is already live returns the existing unit's handle.

mod conditions;
mod durable;
mod pool;
mod retry;
mod work;

pub use conditions::{DeviceConditions, HostConditions, NetworkStatus, constraints_met};
pub use durable::{DurableScheduler, WorkEvent};
pub use pool::{PoolSettings, PoolStats, WorkerPool};
pub use retry::{DEFAULT_MAX_ATTEMPTS, RetryDecision, RetryPolicy};
pub use work::{
    NetworkType, WorkConstraints, WorkContext, WorkHandle, WorkOutcome, WorkRequest, WorkState,
    WorkUnit, Worker,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

/// Errors raised by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Persisting or reading work units failed.
    #[error("work queue database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A unit payload or constraint set could not be (de)serialized.
    #[error("invalid work payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// No unit exists for the handle.
    #[error("work unit not found: {0}")]
    NotFound(String),

    /// The pool's concurrency semaphore was closed.
    #[error("worker pool closed")]
    PoolClosed,
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Scheduling surface used by the orchestrator and the sync daemon.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Enqueues `request` unless a live unit with the same unique key exists,
    /// in which case the existing unit's handle is returned.
    async fn enqueue_unique(&self, request: WorkRequest) -> Result<WorkHandle>;

    /// Cancels a unit. Returns `false` if it was already finished or unknown.
    async fn cancel(&self, handle: &WorkHandle) -> Result<bool>;

    /// Cancels every live unit carrying `tag` and returns how many were cancelled.
    async fn cancel_by_tag(&self, tag: &str) -> Result<u64>;

    /// Streams the state of a unit.
    async fn observe(&self, handle: &WorkHandle) -> Result<watch::Receiver<WorkState>>;
}
