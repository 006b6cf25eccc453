//! PostgreSQL-backed implementation of the work queue port.
//!
//! Each operation is a single statement so leasing stays atomic under
//! concurrent workers: the dequeue claim uses `FOR UPDATE SKIP LOCKED` and
//! the failure transition is computed server-side in one UPDATE. Duplicate
//! `(source, external_id, event_type)` rows are allowed; the downstream
//! upsert's idempotency carries deduplication.

use std::sync::Arc;

use async_trait::async_trait;
use inflow_core::WorkQueue;
use inflow_domain::{
    NewQueueItem, QueueConfig, QueueHealth, QueueItem, QueueStatus, Result, Source,
    SourceQueueStats,
};
use tokio_postgres::Row;
use tracing::warn;

use super::session::DbSession;

/// PostgreSQL work queue over `queue_items`.
pub struct PgQueueRepository {
    session: Arc<DbSession>,
    config: QueueConfig,
}

impl PgQueueRepository {
    pub fn new(session: Arc<DbSession>, config: QueueConfig) -> Self {
        Self { session, config }
    }
}

const ENQUEUE_SQL: &str = "INSERT INTO queue_items (
        source, event_type, external_id, status, retry_count, next_retry_at, created_at
    ) VALUES ($1, $2, $3, 'pending', 0, NOW(), NOW())";

const DEQUEUE_SQL: &str = "WITH claimed AS (
        SELECT id FROM queue_items
        WHERE status = 'pending'
          AND next_retry_at <= NOW()
          AND ($3::text IS NULL OR source = $3)
        ORDER BY next_retry_at ASC, id ASC
        LIMIT $2
        FOR UPDATE SKIP LOCKED
    )
    UPDATE queue_items q
    SET status = 'processing', claimed_by = $1, claimed_at = NOW()
    FROM claimed c
    WHERE q.id = c.id
    RETURNING q.id, q.source, q.event_type, q.external_id, q.status, q.retry_count,
              q.next_retry_at, q.claimed_by, q.claimed_at, q.created_at, q.completed_at,
              q.last_error, q.processing_time_ms";

const MARK_COMPLETED_SQL: &str = "UPDATE queue_items
    SET status = 'completed', completed_at = NOW(), processing_time_ms = $2
    WHERE id = $1 AND status <> 'completed'";

// The failure transition reads the pre-update retry_count, so the backoff
// exponent is the new attempt number (retry_count + 1). Jitter is uniform
// over one base interval, the whole delay capped per configuration.
const MARK_FAILED_SQL: &str = "UPDATE queue_items
    SET retry_count = retry_count + 1,
        last_error = $2,
        claimed_by = NULL,
        claimed_at = NULL,
        status = CASE
            WHEN $3 AND retry_count + 1 < $4 THEN 'pending'
            ELSE 'dead_letter'
        END,
        next_retry_at = CASE
            WHEN $3 AND retry_count + 1 < $4 THEN
                NOW() + (LEAST($6, $5 * power(2, retry_count + 1) + random() * $5)
                         * interval '1 second')
            ELSE next_retry_at
        END
    WHERE id = $1";

const RESET_STUCK_SQL: &str = "UPDATE queue_items
    SET status = 'pending', claimed_by = NULL, claimed_at = NULL
    WHERE status = 'processing'
      AND claimed_at < NOW() - ($1 * interval '1 minute')";

const CLEANUP_SQL: &str = "DELETE FROM queue_items
    WHERE status = 'completed'
      AND completed_at < NOW() - ($1 * interval '1 day')";

const HEALTH_SQL: &str = "SELECT
        source,
        COUNT(*) FILTER (WHERE status = 'pending') AS pending,
        COUNT(*) FILTER (WHERE status = 'processing') AS processing,
        COUNT(*) FILTER (WHERE status = 'failed') AS failed,
        COUNT(*) FILTER (WHERE status = 'dead_letter') AS dead_letter,
        COALESCE(AVG(processing_time_ms) FILTER (WHERE status = 'completed'), 0)::float8
            AS avg_processing_time_ms,
        COUNT(*) FILTER (
            WHERE status = 'processing'
              AND claimed_at < NOW() - ($1 * interval '1 minute')
        ) AS stuck_items
    FROM queue_items
    GROUP BY source";

#[async_trait]
impl WorkQueue for PgQueueRepository {
    async fn enqueue(&self, item: &NewQueueItem) -> Result<()> {
        // Fail-fast path: webhook handlers surface enqueue failure as 503
        // and rely on the sender's redelivery, so no retry loop here.
        self.session
            .execute_once(|client| {
                let source = item.source.as_str();
                let event_type = item.event_type.clone();
                let external_id = item.external_id.clone();
                async move {
                    client
                        .execute(ENQUEUE_SQL, &[&source, &event_type, &external_id])
                        .await
                        .map(|_| ())
                }
            })
            .await
    }

    async fn dequeue_batch(
        &self,
        worker_id: &str,
        max_items: usize,
        source: Option<Source>,
    ) -> Result<Vec<QueueItem>> {
        if max_items == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(max_items).unwrap_or(i64::MAX);
        let source_filter = source.map(|s| s.as_str().to_string());

        let rows = self
            .session
            .execute(|client| {
                let worker_id = worker_id.to_string();
                let source_filter = source_filter.clone();
                async move {
                    client.query(DEQUEUE_SQL, &[&worker_id, &limit, &source_filter]).await
                }
            })
            .await?;

        Ok(rows.iter().filter_map(map_queue_row).collect())
    }

    async fn mark_completed(&self, id: i64, processing_time_ms: Option<i64>) -> Result<()> {
        self.session
            .execute(|client| async move {
                client.execute(MARK_COMPLETED_SQL, &[&id, &processing_time_ms]).await.map(|_| ())
            })
            .await
    }

    async fn mark_failed(&self, id: i64, error: &str, retry: bool) -> Result<()> {
        let max_attempts = self.config.max_attempts;
        let base_secs = self.config.retry_base.as_secs_f64();
        let cap_secs = self.config.retry_cap.as_secs_f64();
        let error = truncate_error(error);

        self.session
            .execute(|client| {
                let error = error.clone();
                async move {
                    client
                        .execute(
                            MARK_FAILED_SQL,
                            &[&id, &error, &retry, &max_attempts, &base_secs, &cap_secs],
                        )
                        .await
                        .map(|_| ())
                }
            })
            .await
    }

    async fn reset_stuck_items(&self, stuck_threshold_minutes: i64) -> Result<u64> {
        let minutes = stuck_threshold_minutes as f64;
        self.session
            .execute(|client| async move { client.execute(RESET_STUCK_SQL, &[&minutes]).await })
            .await
    }

    async fn cleanup_completed(&self, retention_days: i64) -> Result<u64> {
        let days = retention_days as f64;
        self.session
            .execute(|client| async move { client.execute(CLEANUP_SQL, &[&days]).await })
            .await
    }

    async fn health(&self, stuck_threshold_minutes: i64) -> Result<QueueHealth> {
        let minutes = stuck_threshold_minutes as f64;
        let rows = self
            .session
            .execute(|client| async move { client.query(HEALTH_SQL, &[&minutes]).await })
            .await?;

        let mut health = QueueHealth::new();
        for row in &rows {
            let source: String = row.get("source");
            health.insert(
                source,
                SourceQueueStats {
                    pending: row.get("pending"),
                    processing: row.get("processing"),
                    failed: row.get("failed"),
                    dead_letter: row.get("dead_letter"),
                    avg_processing_time_ms: row.get("avg_processing_time_ms"),
                    stuck_items: row.get("stuck_items"),
                },
            );
        }
        Ok(health)
    }
}

/// Map a `queue_items` row, skipping rows whose source or status no longer
/// parses (schema drift) rather than poisoning the whole batch.
fn map_queue_row(row: &Row) -> Option<QueueItem> {
    let id: i64 = row.get("id");
    let source_raw: String = row.get("source");
    let status_raw: String = row.get("status");

    let source = match source_raw.parse::<Source>() {
        Ok(source) => source,
        Err(err) => {
            warn!(item_id = id, raw = %source_raw, error = %err, "skipping row with unknown source");
            return None;
        }
    };
    let status = match status_raw.parse::<QueueStatus>() {
        Ok(status) => status,
        Err(err) => {
            warn!(item_id = id, raw = %status_raw, error = %err, "unknown queue status, assuming processing");
            QueueStatus::Processing
        }
    };

    Some(QueueItem {
        id,
        source,
        event_type: row.get("event_type"),
        external_id: row.get("external_id"),
        status,
        retry_count: row.get("retry_count"),
        next_retry_at: row.get("next_retry_at"),
        claimed_by: row.get("claimed_by"),
        claimed_at: row.get("claimed_at"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
        last_error: row.get("last_error"),
        processing_time_ms: row.get("processing_time_ms"),
    })
}

fn truncate_error(error: &str) -> String {
    const MAX_LEN: usize = 512;
    if error.len() <= MAX_LEN {
        return error.to_string();
    }
    let mut truncated: String = error.chars().take(MAX_LEN.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}
