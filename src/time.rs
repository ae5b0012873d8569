//! Wall-clock helpers shared by the persistence layers.

/// Current UTC time as unix milliseconds, the timestamp unit stored in every table.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
