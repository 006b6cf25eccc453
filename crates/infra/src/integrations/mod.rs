//! Source API clients and normalizers.

pub mod docs;
pub mod mailbox;
pub mod tracker;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

/// Parse an upstream timestamp string (RFC 3339, with or without `Z`, or a
/// bare date treated as UTC midnight).
pub(crate) fn parse_datetime_str(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Parse a JSON field that should contain a timestamp string.
pub(crate) fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    value.as_str().and_then(parse_datetime_str)
}

/// Read a JSON field as a non-empty string, accepting numbers.
pub(crate) fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
