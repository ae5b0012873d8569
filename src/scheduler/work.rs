//! Work unit types shared by the scheduler, the pool, and workers.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tokio_util::sync::CancellationToken;

/// Opaque handle of a work unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkHandle(String);

impl WorkHandle {
    /// Generates a fresh handle.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the handle as stored in the database.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for WorkHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for WorkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted state of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkState {
    /// Waiting to be claimed (possibly delayed until `next_run_at`).
    Enqueued,
    /// Claimed by a pool and executing.
    Running,
    /// Worker returned success.
    Succeeded,
    /// Worker failed permanently or retries were exhausted.
    Failed,
    /// Cancelled before finishing.
    Cancelled,
}

impl WorkState {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// True once the unit will never run again.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(Self::Enqueued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid work state: {s}")),
        }
    }
}

/// Network a unit requires before it may run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// Runs offline too.
    #[default]
    NotRequired,
    /// Any connected network.
    Connected,
    /// Wi-Fi or another unmetered network.
    Unmetered,
}

/// Device conditions a unit waits for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkConstraints {
    pub network: NetworkType,
    pub battery_not_low: bool,
    pub storage_not_low: bool,
}

/// Description of a unit to enqueue.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub(crate) worker: String,
    pub(crate) unique_key: String,
    pub(crate) tags: Vec<String>,
    pub(crate) constraints: WorkConstraints,
    pub(crate) payload: serde_json::Value,
    pub(crate) initial_delay: Duration,
    pub(crate) max_attempts: Option<u32>,
}

impl WorkRequest {
    /// Creates a request for the worker registered under `worker`.
    #[must_use]
    pub fn new(worker: impl Into<String>, unique_key: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            unique_key: unique_key.into(),
            tags: Vec::new(),
            constraints: WorkConstraints::default(),
            payload: serde_json::Value::Null,
            initial_delay: Duration::ZERO,
            max_attempts: None,
        }
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn constraints(mut self, constraints: WorkConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Delays the first run.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Overrides the scheduler's default attempt budget.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Unique key this request is deduplicated on.
    #[must_use]
    pub fn unique_key(&self) -> &str {
        &self.unique_key
    }
}

/// A persisted work unit.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct WorkUnit {
    pub id: String,
    pub worker: String,
    pub unique_key: String,
    #[sqlx(rename = "tags")]
    pub tags_json: String,
    #[sqlx(rename = "constraints")]
    pub constraints_json: String,
    #[sqlx(rename = "payload")]
    pub payload_json: String,
    #[sqlx(rename = "state")]
    pub state_str: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_run_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl WorkUnit {
    #[must_use]
    pub fn handle(&self) -> WorkHandle {
        WorkHandle::from(self.id.as_str())
    }

    /// Parsed state; an unreadable value is treated as `Failed`.
    #[must_use]
    pub fn state(&self) -> WorkState {
        self.state_str.parse().unwrap_or(WorkState::Failed)
    }

    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        serde_json::from_str(&self.tags_json).unwrap_or_default()
    }

    #[must_use]
    pub fn constraints(&self) -> WorkConstraints {
        serde_json::from_str(&self.constraints_json).unwrap_or_default()
    }

    /// Payload as JSON, `Null` if it cannot be parsed.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload_json).unwrap_or(serde_json::Value::Null)
    }
}

/// What a worker asks the pool to do with its unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// The unit is done.
    Success,
    /// The unit should run again if attempts remain.
    Retry {
        message: String,
        /// Minimum wait requested by the worker (e.g. a `Retry-After` header).
        after: Option<Duration>,
    },
    /// The unit failed permanently.
    Failure { message: String },
}

impl WorkOutcome {
    /// Convenience constructor for a retry without a requested delay.
    #[must_use]
    pub fn retry(message: impl Into<String>) -> Self {
        Self::Retry {
            message: message.into(),
            after: None,
        }
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }
}

/// Everything a worker gets to know about the unit it runs.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub handle: WorkHandle,
    /// 1-indexed attempt number of this run.
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: serde_json::Value,
    /// Fired when the unit is cancelled while running.
    pub cancellation: CancellationToken,
}

impl WorkContext {
    /// True when a `Retry` outcome would not run the unit again.
    #[must_use]
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Deserializes the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// A unit of background work the pool knows how to run.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Name units are enqueued under.
    fn kind(&self) -> &'static str;

    /// Runs one attempt.
    async fn execute(&self, ctx: &WorkContext) -> WorkOutcome;

    /// Called once after the unit has failed for good, whatever the cause,
    /// including a panic in [`Self::execute`].
    async fn on_failed(&self, _ctx: &WorkContext, _message: &str) {}
}
