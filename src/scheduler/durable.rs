//! `SQLite`-backed scheduler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::Row;
use tokio::sync::{Notify, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::retry::DEFAULT_MAX_ATTEMPTS;
use super::{Result, SchedulerError, TaskScheduler, WorkHandle, WorkRequest, WorkState, WorkUnit};
use crate::db::Database;
use crate::time::now_millis;

/// Capacity of the state-change feed.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// SQL list of live states for `IN (...)` clauses.
const LIVE_SQL: &str = "('enqueued', 'running')";

/// A unit changed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkEvent {
    pub handle: WorkHandle,
    pub state: WorkState,
}

/// Where [`DurableScheduler::finish`] left a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finished {
    /// Stored in the requested terminal state.
    Settled,
    /// Requested again while running; back in the queue.
    Requeued,
    /// Cancelled while running; the cancelled state is kept.
    Cancelled,
}

/// Durable scheduler over the `work_units` table.
///
/// Cloning is cheap; clones share the cancellation registry, the event feed,
/// and the wake-up signal used by [`super::WorkerPool`].
#[derive(Debug, Clone)]
pub struct DurableScheduler {
    db: Database,
    running: Arc<DashMap<String, CancellationToken>>,
    events: broadcast::Sender<WorkEvent>,
    wake: Arc<Notify>,
    default_max_attempts: u32,
}

impl DurableScheduler {
    #[must_use]
    pub fn new(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            running: Arc::new(DashMap::new()),
            events,
            wake: Arc::new(Notify::new()),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sets the attempt budget for requests that do not specify one.
    #[must_use]
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    /// Reads a unit by handle.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Database`] if the query fails.
    pub async fn get(&self, handle: &WorkHandle) -> Result<Option<WorkUnit>> {
        let unit = sqlx::query_as::<_, WorkUnit>(r"SELECT * FROM work_units WHERE id = ?")
            .bind(handle.as_str())
            .fetch_optional(self.db.pool())
            .await?;
        Ok(unit)
    }

    /// Lists units in `state`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Database`] if the query fails.
    pub async fn list_in_state(&self, state: WorkState) -> Result<Vec<WorkUnit>> {
        let units = sqlx::query_as::<_, WorkUnit>(
            r"SELECT * FROM work_units WHERE state = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(state.as_str())
        .fetch_all(self.db.pool())
        .await?;
        Ok(units)
    }

    /// Subscribes to state changes of every unit.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkEvent> {
        self.events.subscribe()
    }

    /// Resets units left `running` by a previous process to `enqueued`.
    #[instrument(skip(self))]
    pub(crate) async fn recover_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE work_units
              SET state = ?, next_run_at = ?, rerun_requested = 0, updated_at = ?
              WHERE state = ?",
        )
        .bind(WorkState::Enqueued.as_str())
        .bind(now_millis())
        .bind(now_millis())
        .bind(WorkState::Running.as_str())
        .execute(self.db.pool())
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(recovered, "re-enqueued interrupted work units");
        }
        Ok(recovered)
    }

    /// Enqueued units whose `next_run_at` has passed, soonest first.
    pub(crate) async fn due_units(&self, limit: usize) -> Result<Vec<WorkUnit>> {
        let units = sqlx::query_as::<_, WorkUnit>(
            r"SELECT * FROM work_units
              WHERE state = ? AND next_run_at <= ?
              ORDER BY next_run_at ASC, created_at ASC, rowid ASC
              LIMIT ?",
        )
        .bind(WorkState::Enqueued.as_str())
        .bind(now_millis())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.db.pool())
        .await?;
        Ok(units)
    }

    /// Earliest `next_run_at` among enqueued units.
    pub(crate) async fn next_due_at(&self) -> Result<Option<i64>> {
        let next: Option<i64> =
            sqlx::query_scalar(r"SELECT MIN(next_run_at) FROM work_units WHERE state = ?")
                .bind(WorkState::Enqueued.as_str())
                .fetch_one(self.db.pool())
                .await?;
        Ok(next)
    }

    /// Atomically moves an enqueued unit to `running` and bumps its attempt count.
    ///
    /// The cancellation token is registered before the state flip so that a
    /// concurrent [`TaskScheduler::cancel`] always finds it.
    pub(crate) async fn claim(&self, id: &str) -> Result<Option<(WorkUnit, CancellationToken)>> {
        let token = CancellationToken::new();
        self.running.insert(id.to_string(), token.clone());

        let claimed = sqlx::query_as::<_, WorkUnit>(
            r"UPDATE work_units
              SET state = ?, attempts = attempts + 1, updated_at = ?
              WHERE id = ? AND state = ?
              RETURNING *",
        )
        .bind(WorkState::Running.as_str())
        .bind(now_millis())
        .bind(id)
        .bind(WorkState::Enqueued.as_str())
        .fetch_optional(self.db.pool())
        .await;

        match claimed {
            Ok(Some(unit)) => {
                self.publish(&unit.handle(), WorkState::Running);
                Ok(Some((unit, token)))
            }
            Ok(None) => {
                self.running.remove(id);
                Ok(None)
            }
            Err(error) => {
                self.running.remove(id);
                Err(error.into())
            }
        }
    }

    /// Finishes a running unit.
    ///
    /// A unit whose key was enqueued again while it ran goes back to the queue
    /// with a fresh attempt budget instead of taking `state`.
    pub(crate) async fn finish(
        &self,
        id: &str,
        state: WorkState,
        error: Option<&str>,
    ) -> Result<Finished> {
        self.running.remove(id);
        let now = now_millis();
        let row = sqlx::query(
            r"UPDATE work_units
              SET state = CASE WHEN rerun_requested = 1 THEN ? ELSE ? END,
                  attempts = CASE WHEN rerun_requested = 1 THEN 0 ELSE attempts END,
                  next_run_at = CASE WHEN rerun_requested = 1 THEN ? ELSE next_run_at END,
                  rerun_requested = 0,
                  last_error = ?,
                  updated_at = ?
              WHERE id = ? AND state = ?
              RETURNING state",
        )
        .bind(WorkState::Enqueued.as_str())
        .bind(state.as_str())
        .bind(now)
        .bind(error)
        .bind(now)
        .bind(id)
        .bind(WorkState::Running.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        let Some(row) = row else {
            return Ok(Finished::Cancelled);
        };
        let handle = WorkHandle::from(id);
        if row.get::<String, _>("state") == WorkState::Enqueued.as_str() {
            debug!(work_id = %id, "unit requested again while running, re-enqueued");
            self.publish(&handle, WorkState::Enqueued);
            self.wake.notify_one();
            return Ok(Finished::Requeued);
        }
        self.publish(&handle, state);
        Ok(Finished::Settled)
    }

    /// Puts a running unit back in the queue to run after `delay`.
    pub(crate) async fn reschedule(&self, id: &str, delay: Duration, error: &str) -> Result<bool> {
        self.running.remove(id);
        let next_run_at = now_millis().saturating_add(duration_millis(delay));
        let result = sqlx::query(
            r"UPDATE work_units
              SET state = ?, next_run_at = ?, last_error = ?, updated_at = ?
              WHERE id = ? AND state = ?",
        )
        .bind(WorkState::Enqueued.as_str())
        .bind(next_run_at)
        .bind(error)
        .bind(now_millis())
        .bind(id)
        .bind(WorkState::Running.as_str())
        .execute(self.db.pool())
        .await?;

        let rescheduled = result.rows_affected() > 0;
        if rescheduled {
            self.publish(&WorkHandle::from(id), WorkState::Enqueued);
            self.wake.notify_one();
        }
        Ok(rescheduled)
    }

    /// Resolves when new or rescheduled work may be runnable.
    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    fn publish(&self, handle: &WorkHandle, state: WorkState) {
        // No subscribers is not an error.
        let _ = self.events.send(WorkEvent {
            handle: handle.clone(),
            state,
        });
    }

    fn fire_token(&self, id: &str) {
        if let Some((_, token)) = self.running.remove(id) {
            debug!(work_id = %id, "signalling running unit to stop");
            token.cancel();
        }
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl TaskScheduler for DurableScheduler {
    #[instrument(skip(self, request), fields(unique_key = %request.unique_key, worker = %request.worker))]
    async fn enqueue_unique(&self, request: WorkRequest) -> Result<WorkHandle> {
        let now = now_millis();
        let handle = WorkHandle::generate();
        let max_attempts = request.max_attempts.unwrap_or(self.default_max_attempts);

        // The live-key unique index turns a duplicate into an ignored insert.
        let inserted = sqlx::query(
            r"INSERT OR IGNORE INTO work_units (
                id, worker, unique_key, tags, constraints, payload, state,
                attempts, max_attempts, next_run_at, created_at, updated_at
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(handle.as_str())
        .bind(&request.worker)
        .bind(&request.unique_key)
        .bind(serde_json::to_string(&request.tags)?)
        .bind(serde_json::to_string(&request.constraints)?)
        .bind(serde_json::to_string(&request.payload)?)
        .bind(WorkState::Enqueued.as_str())
        .bind(i64::from(max_attempts))
        .bind(now.saturating_add(duration_millis(request.initial_delay)))
        .bind(now)
        .bind(now)
        .fetch_optional(self.db.pool())
        .await?;

        if inserted.is_some() {
            debug!(work_id = %handle, "enqueued work unit");
            self.publish(&handle, WorkState::Enqueued);
            self.wake.notify_one();
            return Ok(handle);
        }

        // A running unit is flagged to run once more after it settles, so a
        // request made while it winds down is never absorbed by it.
        let existing = sqlx::query(&format!(
            r"UPDATE work_units
              SET rerun_requested = CASE WHEN state = ? THEN 1 ELSE rerun_requested END
              WHERE unique_key = ? AND state IN {LIVE_SQL}
              RETURNING id, state"
        ))
        .bind(WorkState::Running.as_str())
        .bind(&request.unique_key)
        .fetch_optional(self.db.pool())
        .await?;

        match existing {
            Some(row) => {
                let handle = WorkHandle::from(row.get::<String, _>("id"));
                let state: String = row.get("state");
                debug!(work_id = %handle, state, "kept existing live unit");
                Ok(handle)
            }
            // The live unit finished between the insert and the lookup.
            None => self.enqueue_unique(request).await,
        }
    }

    #[instrument(skip(self))]
    async fn cancel(&self, handle: &WorkHandle) -> Result<bool> {
        let result = sqlx::query(&format!(
            r"UPDATE work_units SET state = ?, updated_at = ?
              WHERE id = ? AND state IN {LIVE_SQL}"
        ))
        .bind(WorkState::Cancelled.as_str())
        .bind(now_millis())
        .bind(handle.as_str())
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }
        self.fire_token(handle.as_str());
        self.publish(handle, WorkState::Cancelled);
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn cancel_by_tag(&self, tag: &str) -> Result<u64> {
        let rows = sqlx::query(&format!(
            r"UPDATE work_units SET state = ?, updated_at = ?
              WHERE state IN {LIVE_SQL}
                AND EXISTS (SELECT 1 FROM json_each(work_units.tags) WHERE json_each.value = ?)
              RETURNING id"
        ))
        .bind(WorkState::Cancelled.as_str())
        .bind(now_millis())
        .bind(tag)
        .fetch_all(self.db.pool())
        .await?;

        for row in &rows {
            let id: String = row.get("id");
            self.fire_token(&id);
            self.publish(&WorkHandle::from(id), WorkState::Cancelled);
        }
        if !rows.is_empty() {
            info!(tag, cancelled = rows.len(), "cancelled work units by tag");
        }
        Ok(rows.len() as u64)
    }

    async fn observe(&self, handle: &WorkHandle) -> Result<watch::Receiver<WorkState>> {
        // Subscribe before reading so no transition is missed.
        let mut events = self.events.subscribe();
        let unit = self
            .get(handle)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(handle.to_string()))?;

        let (tx, rx) = watch::channel(unit.state());
        let scheduler = self.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    event = events.recv() => match event {
                        Ok(event) if event.handle == handle => {
                            tx.send_if_modified(|state| {
                                let changed = *state != event.state;
                                *state = event.state;
                                changed
                            });
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            match scheduler.get(&handle).await {
                                Ok(Some(unit)) => {
                                    let current = unit.state();
                                    tx.send_if_modified(|state| {
                                        let changed = *state != current;
                                        *state = current;
                                        changed
                                    });
                                }
                                Ok(None) => break,
                                Err(error) => warn!(error = %error, "failed to refresh work state"),
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(rx)
    }
}
