//! Time helpers.
//!
//! Server timestamps arrive either as RFC 3339 strings or as epoch
//! milliseconds; everything inside the crate is `DateTime<Utc>`.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};

/// Current time in UTC.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Parse an RFC 3339 timestamp (`2024-05-01T12:00:00.000Z`).
pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Convert epoch milliseconds into a UTC timestamp.
pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Calendar day of `at` as seen from `offset`.
pub fn day_key(at: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    at.with_timezone(&offset).date_naive()
}
