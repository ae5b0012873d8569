//! Classification of transfer failures.
//!
//! | Error | Type | Reason |
//! |-------|------|--------|
//! | HTTP 408, 5xx | Transient | Server may recover |
//! | HTTP 429 | RateLimited | Retry after the server's delay |
//! | HTTP 416 | Transient | Stale partial file was discarded |
//! | Other HTTP 4xx | Permanent | Won't succeed |
//! | Timeout | Transient | Network may recover |
//! | Network (most) | Transient | Connection may come back |
//! | Network (TLS) | Permanent | Certificate/config issue |
//! | Integrity | Transient | Body was cut short |
//! | IO | Permanent | Local file system issue |
//! | Store busy/pool timeout | Transient | Contention clears |

use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::TransferError;
use crate::catalog::CatalogError;

/// Maximum honored `Retry-After` delay (1 hour).
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Classification of transfer failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    Transient,
    /// Failure that won't succeed regardless of retries.
    Permanent,
    /// Server rate limiting (HTTP 429).
    RateLimited,
}

impl FailureType {
    /// True when the scheduler should run the transfer again.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

/// Classifies a transfer error.
#[instrument]
pub fn classify_error(error: &TransferError) -> FailureType {
    match error {
        TransferError::HttpStatus { status, .. } => classify_http_status(*status),
        TransferError::Timeout { .. } | TransferError::Integrity { .. } => FailureType::Transient,
        TransferError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        TransferError::Catalog(CatalogError::Timeout { .. } | CatalogError::Network { .. }) => {
            FailureType::Transient
        }
        TransferError::Store(store) if store.is_contention() => FailureType::Transient,
        TransferError::Io { .. }
        | TransferError::Catalog(_)
        | TransferError::Store(_)
        | TransferError::Client(_) => FailureType::Permanent,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,   // Request Timeout
        416 => FailureType::Transient,   // Range Not Satisfiable
        429 => FailureType::RateLimited, // Too Many Requests

        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,

        _ => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

/// Parses a `Retry-After` header (delta-seconds or HTTP-date), capped at 1 hour.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(cap_retry_after(duration));
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    let duration = datetime
        .duration_since(std::time::SystemTime::now())
        .unwrap_or(Duration::ZERO);
    Some(cap_retry_after(duration))
}

fn cap_retry_after(duration: Duration) -> Duration {
    if duration > MAX_RETRY_AFTER {
        warn!(
            delay_secs = duration.as_secs(),
            max_secs = MAX_RETRY_AFTER.as_secs(),
            "Retry-After exceeds maximum, capping at 1 hour"
        );
        return MAX_RETRY_AFTER;
    }
    duration
}

/// Delay the server asked for, if the error carries one.
pub(crate) fn retry_after_of(error: &TransferError) -> Option<Duration> {
    match error {
        TransferError::HttpStatus {
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}
