//! Reconciliation checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::queue::Source;

/// High-water mark for a source's backfill reconciliation.
///
/// `last_event_time` is non-decreasing across successful polls. Written only
/// by the reconciler at the end of each poll window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source: Source,
    pub last_event_time: DateTime<Utc>,
    /// Opaque pagination cursor, when the source API hands one out.
    pub last_cursor: Option<String>,
}

impl Checkpoint {
    pub fn new(source: Source, last_event_time: DateTime<Utc>) -> Self {
        Self { source, last_event_time, last_cursor: None }
    }
}
