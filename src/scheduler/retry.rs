//! Exponential backoff for work units that ask to be retried.
//!
//! When a worker returns [`super::WorkOutcome::Retry`], the pool consults the
//! [`RetryPolicy`] with the attempt that just ran and the unit's attempt
//! budget. The policy either schedules the next attempt after a backoff delay
//! or gives up, in which case the unit becomes `failed`.
//!
//! # Delay Calculation
//!
//! ```text
//! delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
//! ```
//!
//! With defaults, delays are approximately: 30s, 60s, 120s, ... capped at 1h.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

/// Default attempt budget for a work unit, including the initial attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay for the first retry (30 seconds).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(30);

/// Default maximum delay cap (1 hour).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3600);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Default maximum jitter added to delays (5 seconds).
const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(5);

/// Decision on whether to run a unit again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after the specified delay.
    Retry {
        /// How long to wait before the next attempt.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Give up; the unit fails.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Backoff configuration shared by every unit the pool runs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt (typically 2.0 for doubling).
    backoff_multiplier: f32,

    /// Upper bound of the random jitter added to each delay.
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom backoff settings.
    #[must_use]
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
        max_jitter: Duration,
    ) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            backoff_multiplier: backoff_multiplier.max(1.0),
            max_jitter,
        }
    }

    /// A policy that retries without delay; used by one-shot draining and tests.
    #[must_use]
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1.0, Duration::ZERO)
    }

    /// Decides whether to run a unit again after `attempt` (1-indexed) failed.
    #[instrument(skip(self))]
    pub fn should_retry(&self, attempt: u32, max_attempts: u32) -> RetryDecision {
        if attempt >= max_attempts {
            debug!(attempt, max = max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({max_attempts}) exhausted"),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Formula: `min(base_delay * multiplier^(attempt-1), max_delay) + jitter`
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=max_ms))
    }
}
