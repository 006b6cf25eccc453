//! Work queue domain types.
//!
//! A queue item is a minimal unit of pending work: which source it came
//! from, what kind of event it was, and the remote record id. No payload is
//! stored; the remote system is authoritative and normalizers re-fetch the
//! current state on dequeue.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::InflowError;

/// The closed set of upstream systems feeding the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Task tracker
    Tracker,
    /// Shared mailbox
    Mailbox,
    /// Document store (optional)
    Docs,
}

impl Source {
    /// Stable string key used in the database and in webhook routes.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tracker => "tracker",
            Self::Mailbox => "mailbox",
            Self::Docs => "docs",
        }
    }

    /// All known sources, in dispatch order.
    pub fn all() -> [Source; 3] {
        [Self::Tracker, Self::Mailbox, Self::Docs]
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = InflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tracker" => Ok(Self::Tracker),
            "mailbox" => Ok(Self::Mailbox),
            "docs" => Ok(Self::Docs),
            other => Err(InflowError::InvalidInput(format!("unknown source: {other}"))),
        }
    }
}

/// Lifecycle state of a queue item.
///
/// `pending → processing → completed`, or `failed` back to `pending` with a
/// retry delay until the retry budget is exhausted, then `dead_letter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Terminal states are never dequeued again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = InflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(InflowError::InvalidInput(format!("unknown queue status: {other}"))),
        }
    }
}

/// A persisted unit of pending work, leased to a single worker while
/// `processing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub source: Source,
    pub event_type: String,
    pub external_id: String,
    pub status: QueueStatus,
    pub retry_count: i32,
    pub next_retry_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub processing_time_ms: Option<i64>,
}

/// The enqueue shape: everything a webhook or backfill knows about an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub source: Source,
    pub event_type: String,
    pub external_id: String,
}

impl NewQueueItem {
    pub fn new(source: Source, event_type: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self { source, event_type: event_type.into(), external_id: external_id.into() }
    }
}

/// Per-source queue statistics surfaced by the health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceQueueStats {
    pub pending: i64,
    pub processing: i64,
    pub failed: i64,
    pub dead_letter: i64,
    pub avg_processing_time_ms: f64,
    pub stuck_items: i64,
}

/// Queue health keyed by source name. BTreeMap keeps the JSON stable.
pub type QueueHealth = BTreeMap<String, SourceQueueStats>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_round_trips_through_strings() {
        for source in Source::all() {
            assert_eq!(source.as_str().parse::<Source>().unwrap(), source);
        }
        assert!("calendar".parse::<Source>().is_err());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Completed,
            QueueStatus::Failed,
            QueueStatus::DeadLetter,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
    }

    #[test]
    fn terminal_states_are_completed_and_dead_letter() {
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::DeadLetter.is_terminal());
        assert!(!QueueStatus::Pending.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
        assert!(!QueueStatus::Failed.is_terminal());
    }

    #[test]
    fn source_serializes_lowercase() {
        let json = serde_json::to_string(&Source::Tracker).unwrap();
        assert_eq!(json, "\"tracker\"");
    }

    #[test]
    fn new_queue_item_carries_only_identifiers() {
        let item = NewQueueItem::new(Source::Mailbox, "incoming_email", "conv-1");
        assert_eq!(item.source, Source::Mailbox);
        assert_eq!(item.event_type, "incoming_email");
        assert_eq!(item.external_id, "conv-1");
    }
}
