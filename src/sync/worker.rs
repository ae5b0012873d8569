//! Scheduler adapter for the reconciler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::SyncReconciler;
use crate::scheduler::{NetworkType, WorkConstraints, WorkContext, WorkOutcome, WorkRequest, Worker};

/// Name reconciler units are enqueued under.
pub const SYNC_WORKER: &str = "sync";

/// Unique key of the periodic reconciler unit.
pub const SYNC_UNIQUE_KEY: &str = "sync_reconcile";

/// Tag carried by reconciler units.
pub const SYNC_TAG: &str = "sync";

/// Request for one reconciler run.
#[must_use]
pub fn sync_request() -> WorkRequest {
    WorkRequest::new(SYNC_WORKER, SYNC_UNIQUE_KEY)
        .tag(SYNC_TAG)
        .constraints(WorkConstraints {
            network: NetworkType::Connected,
            battery_not_low: true,
            storage_not_low: false,
        })
}

/// Runs [`SyncReconciler::run_once`] as a scheduled unit.
pub struct SyncWorker {
    reconciler: Arc<SyncReconciler>,
}

impl SyncWorker {
    #[must_use]
    pub fn new(reconciler: Arc<SyncReconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl Worker for SyncWorker {
    fn kind(&self) -> &'static str {
        SYNC_WORKER
    }

    async fn execute(&self, ctx: &WorkContext) -> WorkOutcome {
        tokio::select! {
            () = ctx.cancellation.cancelled() => {
                info!("sync run cancelled");
                WorkOutcome::Success
            }
            result = self.reconciler.run_once() => match result {
                Ok(_) => WorkOutcome::Success,
                Err(e) => {
                    warn!(error = %e, "sync run failed");
                    WorkOutcome::retry(e.to_string())
                }
            },
        }
    }
}
