//! Port interfaces for reconciliation and database health.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inflow_domain::{Checkpoint, Result, Source};

/// Persistent per-source reconciliation high-water marks.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the checkpoint for a source, if one has been written.
    async fn get_checkpoint(&self, source: Source) -> Result<Option<Checkpoint>>;

    /// Upsert the checkpoint for a source.
    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// Cheap database liveness probe used by health reporting and the
/// supervisor's accept/degrade decision.
#[async_trait]
pub trait DatabaseProbe: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// A remote record summary returned by a backfill listing.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSummary {
    pub external_id: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A source the reconciler can page for records updated since an instant.
#[async_trait]
pub trait BackfillSource: Send + Sync {
    fn source(&self) -> Source;

    /// Where the very first poll window starts when no checkpoint exists:
    /// the configured process-after date, or the source's default lookback.
    fn initial_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc>;

    /// List records updated after `since`, paging until exhausted. The
    /// implementation owns rate-limit handling; an error here means the
    /// window must not advance.
    async fn fetch_updated_since(&self, since: DateTime<Utc>) -> Result<Vec<RemoteSummary>>;
}
