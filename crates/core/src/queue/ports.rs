//! Port interface for the durable work queue.

use async_trait::async_trait;
use inflow_domain::{NewQueueItem, QueueHealth, QueueItem, Result, Source};

/// At-least-once work queue with a visibility-timeout lease model.
///
/// Implementations must make `dequeue_batch` atomic under concurrent
/// workers: two workers may never claim the same row.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Insert a new pending item. Never blocks on other workers.
    async fn enqueue(&self, item: &NewQueueItem) -> Result<()>;

    /// Atomically claim up to `max_items` due pending items for `worker_id`,
    /// optionally restricted to one source. Claimed items move to
    /// `processing` until acked, failed, or swept by the visibility timeout.
    async fn dequeue_batch(
        &self,
        worker_id: &str,
        max_items: usize,
        source: Option<Source>,
    ) -> Result<Vec<QueueItem>>;

    /// Terminal success. Idempotent.
    async fn mark_completed(&self, id: i64, processing_time_ms: Option<i64>) -> Result<()>;

    /// Record a failure. With `retry` and budget remaining the item returns
    /// to `pending` with an exponential-backoff `next_retry_at`; otherwise it
    /// moves to `dead_letter`.
    async fn mark_failed(&self, id: i64, error: &str, retry: bool) -> Result<()>;

    /// Sweep items claimed longer than the threshold back to `pending`.
    /// Returns the number of items reset.
    async fn reset_stuck_items(&self, stuck_threshold_minutes: i64) -> Result<u64>;

    /// Delete `completed` items older than the retention window. Dead-letter
    /// items are retained indefinitely. Returns the number deleted.
    async fn cleanup_completed(&self, retention_days: i64) -> Result<u64>;

    /// Aggregate per-source counts and processing-time statistics.
    async fn health(&self, stuck_threshold_minutes: i64) -> Result<QueueHealth>;
}
