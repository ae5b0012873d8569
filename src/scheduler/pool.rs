//! Executes due work units with registered workers.
//!
//! # Concurrency Model
//!
//! - Each claimed unit runs in its own Tokio task
//! - A semaphore permit is acquired before a unit is claimed
//! - Permits are released when the task ends (RAII)
//! - Constraints are checked against [`DeviceConditions`] before claiming;
//!   units whose constraints are unmet stay enqueued
//!
//! # Shutdown
//!
//! [`WorkerPool::run`] aborts in-flight tasks when its shutdown token fires.
//! Their units stay `running` in the database and are re-enqueued by
//! [`WorkerPool::recover`] on the next start, so transfers resume from their
//! partial files.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::durable::Finished;
use super::retry::{RetryDecision, RetryPolicy};
use super::{
    DeviceConditions, DurableScheduler, Result, SchedulerError, WorkContext, WorkOutcome,
    WorkState, WorkUnit, Worker, constraints_met,
};
use crate::time::now_millis;

/// Default number of units run at once.
const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default interval between queue polls in [`WorkerPool::run`].
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Maximum due units fetched per poll.
const DUE_BATCH: usize = 64;

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_concurrent: usize,
    pub poll_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Counts of unit outcomes observed by a pool run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    /// Distinct units skipped because their constraints were unmet.
    pub deferred: u64,
}

impl PoolStats {
    /// Units that ran at least once.
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.succeeded + self.failed + self.retried + self.cancelled
    }

    fn record(&mut self, result: UnitResult) {
        match result {
            UnitResult::Succeeded => self.succeeded += 1,
            UnitResult::Failed => self.failed += 1,
            UnitResult::Retried => self.retried += 1,
            UnitResult::Cancelled => self.cancelled += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitResult {
    Succeeded,
    Failed,
    Retried,
    Cancelled,
}

/// Runs work units from a [`DurableScheduler`].
pub struct WorkerPool {
    scheduler: DurableScheduler,
    workers: HashMap<&'static str, Arc<dyn Worker>>,
    conditions: Arc<dyn DeviceConditions>,
    retry_policy: RetryPolicy,
    settings: PoolSettings,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(
        scheduler: DurableScheduler,
        conditions: Arc<dyn DeviceConditions>,
        retry_policy: RetryPolicy,
        settings: PoolSettings,
    ) -> Self {
        let max_concurrent = settings.max_concurrent.max(1);
        debug!(max_concurrent, "creating worker pool");
        Self {
            scheduler,
            workers: HashMap::new(),
            conditions,
            retry_policy,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            settings: PoolSettings {
                max_concurrent,
                ..settings
            },
        }
    }

    /// Registers `worker` for units enqueued under its [`Worker::kind`].
    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.insert(worker.kind(), worker);
    }

    /// Builder form of [`Self::register`].
    #[must_use]
    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.register(worker);
        self
    }

    /// Re-enqueues units interrupted by a previous shutdown or crash.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Database`] if the update fails.
    pub async fn recover(&self) -> Result<u64> {
        self.scheduler.recover_interrupted().await
    }

    /// Runs due units until none are runnable right now.
    ///
    /// Units retried with a backoff delay, or waiting on constraints, are left
    /// for a later run.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] if the queue cannot be read. Individual unit
    /// failures are counted in the returned stats, not returned as errors.
    #[instrument(skip(self))]
    pub async fn run_until_idle(&self) -> Result<PoolStats> {
        let mut stats = PoolStats::default();
        let mut deferred = HashSet::new();

        loop {
            let mut tasks = JoinSet::new();
            for unit in self.scheduler.due_units(DUE_BATCH).await? {
                if !self.is_runnable(&unit, &mut stats, &mut deferred).await? {
                    continue;
                }
                let permit = Arc::clone(&self.semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| SchedulerError::PoolClosed)?;
                self.launch(unit, permit, &mut tasks).await?;
            }

            if tasks.is_empty() {
                break;
            }
            while let Some(joined) = tasks.join_next().await {
                record_joined(&mut stats, joined);
            }
        }

        stats.deferred = deferred.len() as u64;
        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            retried = stats.retried,
            cancelled = stats.cancelled,
            deferred = stats.deferred,
            "work queue idle"
        );
        Ok(stats)
    }

    /// Polls and runs units until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] if interrupted units cannot be recovered.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<PoolStats> {
        self.recover().await?;
        info!(
            max_concurrent = self.settings.max_concurrent,
            workers = self.workers.len(),
            "worker pool started"
        );

        let mut stats = PoolStats::default();
        let mut deferred = HashSet::new();
        let mut tasks = JoinSet::new();

        while !shutdown.is_cancelled() {
            if let Err(error) = self.fill(&mut tasks, &mut stats, &mut deferred).await {
                warn!(error = %error, "failed to poll work queue");
            }
            let wait = self.next_wait().await;

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = self.scheduler.woken() => {}
                () = tokio::time::sleep(wait) => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    record_joined(&mut stats, joined);
                }
            }
        }

        // Units that settled before shutdown still count.
        tasks.abort_all();
        let mut interrupted = 0_usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Err(e) if e.is_cancelled() => interrupted += 1,
                joined => record_joined(&mut stats, joined),
            }
        }
        stats.deferred = deferred.len() as u64;
        info!(interrupted, "worker pool stopped");
        Ok(stats)
    }

    /// Launches due units while permits are free.
    async fn fill(
        &self,
        tasks: &mut JoinSet<UnitResult>,
        stats: &mut PoolStats,
        deferred: &mut HashSet<String>,
    ) -> Result<()> {
        if self.semaphore.available_permits() == 0 {
            return Ok(());
        }
        for unit in self.scheduler.due_units(DUE_BATCH).await? {
            if !self.is_runnable(&unit, stats, deferred).await? {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            self.launch(unit, permit, tasks).await?;
        }
        Ok(())
    }

    /// Time until the next delayed unit becomes due, capped at the poll interval.
    async fn next_wait(&self) -> Duration {
        match self.scheduler.next_due_at().await {
            Ok(Some(at)) => {
                let until = u64::try_from(at.saturating_sub(now_millis())).unwrap_or(0);
                Duration::from_millis(until).min(self.settings.poll_interval)
            }
            _ => self.settings.poll_interval,
        }
    }

    /// Checks the worker registry and constraints for a due unit.
    async fn is_runnable(
        &self,
        unit: &WorkUnit,
        stats: &mut PoolStats,
        deferred: &mut HashSet<String>,
    ) -> Result<bool> {
        if !self.workers.contains_key(unit.worker.as_str()) {
            warn!(work_id = %unit.id, worker = %unit.worker, "no worker registered for unit");
            if self.scheduler.claim(&unit.id).await?.is_some() {
                let message = format!("no worker registered for `{}`", unit.worker);
                let finished = self
                    .scheduler
                    .finish(&unit.id, WorkState::Failed, Some(&message))
                    .await?;
                if finished == Finished::Settled {
                    stats.failed += 1;
                }
            }
            return Ok(false);
        }

        if !constraints_met(self.conditions.as_ref(), &unit.constraints()) {
            if deferred.insert(unit.id.clone()) {
                debug!(work_id = %unit.id, "constraints unmet, deferring unit");
            }
            return Ok(false);
        }
        deferred.remove(&unit.id);
        Ok(true)
    }

    async fn launch(
        &self,
        unit: WorkUnit,
        permit: OwnedSemaphorePermit,
        tasks: &mut JoinSet<UnitResult>,
    ) -> Result<()> {
        let Some(worker) = self.workers.get(unit.worker.as_str()).map(Arc::clone) else {
            return Ok(());
        };
        let Some((unit, token)) = self.scheduler.claim(&unit.id).await? else {
            debug!(work_id = %unit.id, "unit claimed elsewhere");
            return Ok(());
        };

        let scheduler = self.scheduler.clone();
        let retry_policy = self.retry_policy.clone();
        tasks.spawn(async move {
            let _permit = permit;
            run_unit(&scheduler, worker.as_ref(), &retry_policy, unit, token).await
        });
        Ok(())
    }
}

fn record_joined(
    stats: &mut PoolStats,
    joined: std::result::Result<UnitResult, tokio::task::JoinError>,
) {
    match joined {
        Ok(result) => stats.record(result),
        Err(e) => warn!(error = %e, "work task ended abnormally"),
    }
}

#[instrument(skip_all, fields(work_id = %unit.id, worker = %unit.worker, attempt = unit.attempts))]
async fn run_unit(
    scheduler: &DurableScheduler,
    worker: &dyn Worker,
    retry_policy: &RetryPolicy,
    unit: WorkUnit,
    cancellation: CancellationToken,
) -> UnitResult {
    let ctx = WorkContext {
        handle: unit.handle(),
        attempt: u32::try_from(unit.attempts).unwrap_or(u32::MAX),
        max_attempts: u32::try_from(unit.max_attempts).unwrap_or(1),
        payload: unit.payload(),
        cancellation,
    };

    let outcome = AssertUnwindSafe(worker.execute(&ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!("worker panicked");
            WorkOutcome::failure("worker panicked")
        });

    match settle(scheduler, worker, retry_policy, &ctx, outcome).await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "failed to record work outcome");
            UnitResult::Failed
        }
    }
}

async fn settle(
    scheduler: &DurableScheduler,
    worker: &dyn Worker,
    retry_policy: &RetryPolicy,
    ctx: &WorkContext,
    outcome: WorkOutcome,
) -> Result<UnitResult> {
    let id = ctx.handle.as_str();
    let failure = match outcome {
        WorkOutcome::Success => {
            let finished = scheduler.finish(id, WorkState::Succeeded, None).await?;
            return Ok(unit_result(finished, UnitResult::Succeeded));
        }
        WorkOutcome::Failure { message } => {
            warn!(error = %message, "work unit failed");
            message
        }
        WorkOutcome::Retry { message, after } => {
            match retry_policy.should_retry(ctx.attempt, ctx.max_attempts) {
                RetryDecision::Retry { delay, attempt } => {
                    let delay = after.map_or(delay, |after| after.max(delay));
                    info!(
                        next_attempt = attempt,
                        delay_ms = delay.as_millis(),
                        error = %message,
                        "retrying work unit"
                    );
                    let rescheduled = scheduler.reschedule(id, delay, &message).await?;
                    // A unit cancelled while running keeps its cancelled state.
                    return Ok(if rescheduled {
                        UnitResult::Retried
                    } else {
                        UnitResult::Cancelled
                    });
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(error = %message, reason, "work unit out of attempts");
                    message
                }
            }
        }
    };

    let finished = scheduler
        .finish(id, WorkState::Failed, Some(&failure))
        .await?;
    if finished == Finished::Settled {
        AssertUnwindSafe(worker.on_failed(ctx, &failure))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| error!("failure hook panicked"));
    }
    Ok(unit_result(finished, UnitResult::Failed))
}

/// Maps how a unit was finished onto the result counted for this run.
fn unit_result(finished: Finished, result: UnitResult) -> UnitResult {
    match finished {
        Finished::Settled => result,
        Finished::Requeued => UnitResult::Retried,
        Finished::Cancelled => UnitResult::Cancelled,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::db::Database;
    use crate::scheduler::{
        NetworkStatus, NetworkType, TaskScheduler, WorkConstraints, WorkHandle, WorkRequest,
    };

    struct Conditions(NetworkStatus);

    impl DeviceConditions for Conditions {
        fn network(&self) -> NetworkStatus {
            self.0
        }

        fn battery_low(&self) -> bool {
            false
        }

        fn storage_low(&self) -> bool {
            false
        }
    }

    /// Fails with `Retry` until `succeed_on` attempts have run.
    struct Flaky {
        runs: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl Worker for Flaky {
        fn kind(&self) -> &'static str {
            "flaky"
        }

        async fn execute(&self, ctx: &WorkContext) -> WorkOutcome {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if ctx.attempt >= self.succeed_on {
                WorkOutcome::Success
            } else {
                WorkOutcome::retry("not yet")
            }
        }
    }

    /// Panics on every attempt and records the failure hook.
    #[derive(Default)]
    struct Panicky {
        failures: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Worker for Panicky {
        fn kind(&self) -> &'static str {
            "panicky"
        }

        async fn execute(&self, _ctx: &WorkContext) -> WorkOutcome {
            panic!("boom");
        }

        async fn on_failed(&self, ctx: &WorkContext, message: &str) {
            self.failures
                .lock()
                .unwrap()
                .push(format!("{}: {message}", ctx.handle));
        }
    }

    async fn pool_with(
        network: NetworkStatus,
        worker: Arc<dyn Worker>,
    ) -> (DurableScheduler, WorkerPool) {
        let scheduler = DurableScheduler::new(Database::new_in_memory().await.unwrap());
        let pool = WorkerPool::new(
            scheduler.clone(),
            Arc::new(Conditions(network)),
            RetryPolicy::immediate(),
            PoolSettings::default(),
        )
        .with_worker(worker);
        (scheduler, pool)
    }

    async fn state_of(scheduler: &DurableScheduler, handle: &WorkHandle) -> WorkState {
        scheduler.get(handle).await.unwrap().unwrap().state()
    }

    #[tokio::test]
    async fn test_run_until_idle_retries_then_succeeds() {
        let worker = Arc::new(Flaky {
            runs: AtomicU32::new(0),
            succeed_on: 3,
        });
        let (scheduler, pool) = pool_with(NetworkStatus::Unmetered, worker.clone()).await;
        let handle = scheduler
            .enqueue_unique(WorkRequest::new("flaky", "k").max_attempts(5))
            .await
            .unwrap();

        let stats = pool.run_until_idle().await.unwrap();

        assert_eq!(worker.runs.load(Ordering::SeqCst), 3);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(state_of(&scheduler, &handle).await, WorkState::Succeeded);
    }

    #[tokio::test]
    async fn test_run_until_idle_fails_when_attempts_exhausted() {
        let worker = Arc::new(Flaky {
            runs: AtomicU32::new(0),
            succeed_on: u32::MAX,
        });
        let (scheduler, pool) = pool_with(NetworkStatus::Unmetered, worker.clone()).await;
        let handle = scheduler
            .enqueue_unique(WorkRequest::new("flaky", "k").max_attempts(2))
            .await
            .unwrap();

        let stats = pool.run_until_idle().await.unwrap();

        assert_eq!(worker.runs.load(Ordering::SeqCst), 2);
        assert_eq!(stats.failed, 1);
        let unit = scheduler.get(&handle).await.unwrap().unwrap();
        assert_eq!(unit.state(), WorkState::Failed);
        assert_eq!(unit.last_error.as_deref(), Some("not yet"));
    }

    #[tokio::test]
    async fn test_unmet_constraints_defer_unit() {
        let worker = Arc::new(Flaky {
            runs: AtomicU32::new(0),
            succeed_on: 1,
        });
        let (scheduler, pool) = pool_with(NetworkStatus::Metered, worker.clone()).await;
        let handle = scheduler
            .enqueue_unique(WorkRequest::new("flaky", "k").constraints(WorkConstraints {
                network: NetworkType::Unmetered,
                ..WorkConstraints::default()
            }))
            .await
            .unwrap();

        let stats = pool.run_until_idle().await.unwrap();

        assert_eq!(stats.deferred, 1);
        assert_eq!(stats.executed(), 0);
        assert_eq!(worker.runs.load(Ordering::SeqCst), 0);
        assert_eq!(state_of(&scheduler, &handle).await, WorkState::Enqueued);
    }

    #[tokio::test]
    async fn test_panicking_worker_fails_unit() {
        let worker = Arc::new(Panicky::default());
        let (scheduler, pool) = pool_with(NetworkStatus::Unmetered, worker.clone()).await;
        let handle = scheduler
            .enqueue_unique(WorkRequest::new("panicky", "k"))
            .await
            .unwrap();

        let stats = pool.run_until_idle().await.unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(state_of(&scheduler, &handle).await, WorkState::Failed);
        assert_eq!(
            *worker.failures.lock().unwrap(),
            vec![format!("{handle}: worker panicked")]
        );
    }

    #[tokio::test]
    async fn test_unknown_worker_fails_unit() {
        let (scheduler, pool) =
            pool_with(NetworkStatus::Unmetered, Arc::new(Panicky::default())).await;
        let handle = scheduler
            .enqueue_unique(WorkRequest::new("nobody", "k"))
            .await
            .unwrap();

        pool.run_until_idle().await.unwrap();

        let unit = scheduler.get(&handle).await.unwrap().unwrap();
        assert_eq!(unit.state(), WorkState::Failed);
        assert!(unit.last_error.unwrap().contains("nobody"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let worker = Arc::new(Flaky {
            runs: AtomicU32::new(0),
            succeed_on: 1,
        });
        let (scheduler, pool) = pool_with(NetworkStatus::Unmetered, worker.clone()).await;
        let handle = scheduler
            .enqueue_unique(WorkRequest::new("flaky", "k"))
            .await
            .unwrap();
        let mut states = scheduler.observe(&handle).await.unwrap();

        let shutdown = CancellationToken::new();
        let runner = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(shutdown).await })
        };

        states
            .wait_for(|state| *state == WorkState::Succeeded)
            .await
            .unwrap();
        shutdown.cancel();
        let stats = runner.await.unwrap().unwrap();
        assert_eq!(worker.runs.load(Ordering::SeqCst), 1);
        assert_eq!(stats.succeeded, 1);
    }
}
