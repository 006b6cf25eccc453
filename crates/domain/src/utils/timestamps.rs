//! Unix timestamp handling for sources that mix seconds and milliseconds.

use chrono::{DateTime, Utc};

/// Any value above this is treated as milliseconds. In seconds it would be
/// a date past the year 2286, which the upstream systems do not produce.
const MILLIS_THRESHOLD: i64 = 10_000_000_000;

/// Convert a unix timestamp of unknown unit to a UTC datetime.
///
/// The mailbox API reports `last_activity_at` in milliseconds but
/// `delivered_at` in seconds; the unit is detected by magnitude.
pub fn from_unix_magnitude(timestamp: i64) -> Option<DateTime<Utc>> {
    if timestamp <= 0 {
        return None;
    }
    if timestamp > MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(timestamp)
    } else {
        DateTime::from_timestamp(timestamp, 0)
    }
}
