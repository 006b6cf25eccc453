//! Queue maintenance.
//!
//! Two periodic jobs on one timer: sweep items stuck in `processing` past
//! the visibility timeout back to `pending` (crash recovery), and delete
//! `completed` rows past the retention window. Dead-letter rows are never
//! touched. The first pass runs immediately so a restart recovers items a
//! crashed worker left leased.

use std::sync::Arc;
use std::time::Duration;

use inflow_core::WorkQueue;
use inflow_domain::{InflowError, Result};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Configuration for the cleanup service.
#[derive(Debug, Clone)]
pub struct CleanupServiceConfig {
    /// Period between maintenance passes.
    pub interval: Duration,
    /// Visibility timeout for the stuck sweep.
    pub visibility_timeout_minutes: i64,
    /// Retention for completed rows.
    pub retention_days: i64,
    /// Join timeout when stopping.
    pub join_timeout: Duration,
}

impl Default for CleanupServiceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            visibility_timeout_minutes: 30,
            retention_days: 7,
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Periodic queue maintenance with explicit lifecycle management.
pub struct CleanupService {
    queue: Arc<dyn WorkQueue>,
    config: CleanupServiceConfig,
    cancellation: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl CleanupService {
    pub fn new(queue: Arc<dyn WorkQueue>, config: CleanupServiceConfig) -> Self {
        Self { queue, config, cancellation: CancellationToken::new(), task_handle: None }
    }

    /// One maintenance pass.
    pub async fn run_once(queue: &Arc<dyn WorkQueue>, config: &CleanupServiceConfig) {
        match queue.reset_stuck_items(config.visibility_timeout_minutes).await {
            Ok(0) => {}
            Ok(reset) => warn!(reset, "reset stuck queue items"),
            Err(err) => error!(error = %err, "stuck item sweep failed"),
        }

        match queue.cleanup_completed(config.retention_days).await {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "cleaned up completed queue items"),
            Err(err) => error!(error = %err, "queue cleanup failed"),
        }
    }

    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(InflowError::Internal("cleanup service already running".into()));
        }

        info!(interval_secs = self.config.interval.as_secs(), "starting cleanup service");
        self.cancellation = CancellationToken::new();

        let queue = Arc::clone(&self.queue);
        let config = self.config.clone();
        let cancel = self.cancellation.clone();

        self.task_handle = Some(tokio::spawn(async move {
            loop {
                Self::run_once(&queue, &config).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(config.interval) => {}
                }
            }
        }));

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(InflowError::Internal("cleanup service not running".into()));
        }

        info!("stopping cleanup service");
        self.cancellation.cancel();

        if let Some(handle) = self.task_handle.take() {
            tokio::time::timeout(self.config.join_timeout, handle)
                .await
                .map_err(|_| InflowError::Internal("cleanup join timeout".into()))?
                .map_err(|_| InflowError::Internal("cleanup task panicked".into()))?;
        }

        info!("cleanup service stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for CleanupService {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("cleanup service dropped while running, cancelling");
            self.cancellation.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use inflow_domain::{NewQueueItem, QueueHealth, QueueItem, Source};

    use super::*;

    #[derive(Default)]
    struct MockQueue {
        stuck_sweeps: Mutex<Vec<i64>>,
        cleanups: Mutex<Vec<i64>>,
        reset_count: AtomicU64,
    }

    #[async_trait]
    impl WorkQueue for MockQueue {
        async fn enqueue(&self, _item: &NewQueueItem) -> Result<()> {
            Ok(())
        }

        async fn dequeue_batch(
            &self,
            _worker_id: &str,
            _max_items: usize,
            _source: Option<Source>,
        ) -> Result<Vec<QueueItem>> {
            Ok(Vec::new())
        }

        async fn mark_completed(&self, _id: i64, _ms: Option<i64>) -> Result<()> {
            Ok(())
        }

        async fn mark_failed(&self, _id: i64, _error: &str, _retry: bool) -> Result<()> {
            Ok(())
        }

        async fn reset_stuck_items(&self, minutes: i64) -> Result<u64> {
            self.stuck_sweeps.lock().unwrap().push(minutes);
            Ok(self.reset_count.load(Ordering::SeqCst))
        }

        async fn cleanup_completed(&self, days: i64) -> Result<u64> {
            self.cleanups.lock().unwrap().push(days);
            Ok(0)
        }

        async fn health(&self, _minutes: i64) -> Result<QueueHealth> {
            Ok(QueueHealth::new())
        }
    }

    #[tokio::test]
    async fn run_once_sweeps_and_cleans_with_configured_windows() {
        let mock = Arc::new(MockQueue::default());
        let queue: Arc<dyn WorkQueue> = mock.clone();
        let config = CleanupServiceConfig {
            visibility_timeout_minutes: 30,
            retention_days: 7,
            ..Default::default()
        };

        CleanupService::run_once(&queue, &config).await;

        assert_eq!(*mock.stuck_sweeps.lock().unwrap(), vec![30]);
        assert_eq!(*mock.cleanups.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn lifecycle_runs_an_immediate_pass() {
        let mock = Arc::new(MockQueue::default());
        let queue: Arc<dyn WorkQueue> = mock.clone();

        let mut service = CleanupService::new(
            queue,
            CleanupServiceConfig { interval: Duration::from_secs(3600), ..Default::default() },
        );
        service.start().unwrap();

        // The first pass runs immediately, not after the first interval
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mock.stuck_sweeps.lock().unwrap().len(), 1);

        service.stop().await.unwrap();
    }
}
