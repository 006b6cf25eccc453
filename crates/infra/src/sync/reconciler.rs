//! Backfill reconciler.
//!
//! Webhooks get lost; the reconciler is the safety net. On startup and on a
//! timer it pages each source for records updated since the stored
//! checkpoint minus an overlap window and enqueues their ids. The overlap
//! re-enqueues boundary records on purpose; the idempotent upsert makes the
//! duplicates harmless. Runs never overlap themselves: a tick that finds a
//! run still in progress is skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use inflow_core::{BackfillSource, CheckpointStore, WorkQueue};
use inflow_domain::{Checkpoint, InflowError, NewQueueItem, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Event type stamped on reconciler enqueues.
const BACKFILL_EVENT: &str = "backfill";

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Timer period between runs.
    pub interval: Duration,
    /// Overlap subtracted from the checkpoint to absorb clock skew and
    /// missed webhooks.
    pub overlap: Duration,
    /// Join timeout when stopping.
    pub join_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            overlap: Duration::from_secs(120),
            join_timeout: Duration::from_secs(5),
        }
    }
}

struct ReconcilerContext {
    sources: Vec<Arc<dyn BackfillSource>>,
    queue: Arc<dyn WorkQueue>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: ReconcilerConfig,
    /// Serializes runs across the startup one-shot and the timer.
    run_lock: Mutex<()>,
}

/// Periodic backfill reconciliation with explicit lifecycle management.
pub struct Reconciler {
    context: Arc<ReconcilerContext>,
    cancellation: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl Reconciler {
    pub fn new(
        sources: Vec<Arc<dyn BackfillSource>>,
        queue: Arc<dyn WorkQueue>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            context: Arc::new(ReconcilerContext {
                sources,
                queue,
                checkpoints,
                config,
                run_lock: Mutex::new(()),
            }),
            cancellation: CancellationToken::new(),
            task_handle: None,
        }
    }

    /// Run one reconciliation pass over every source. Source failures are
    /// isolated: one source erroring leaves the others' windows advancing.
    pub async fn run_once(&self) {
        Self::run_all(&self.context).await;
    }

    /// Start the background loop: one immediate pass, then one per
    /// interval.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(InflowError::Internal("reconciler already running".into()));
        }

        info!(interval_secs = self.context.config.interval.as_secs(), "starting reconciler");
        self.cancellation = CancellationToken::new();

        let context = Arc::clone(&self.context);
        let cancel = self.cancellation.clone();
        self.task_handle = Some(tokio::spawn(async move {
            Self::run_all(&context).await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(context.config.interval) => {
                        Self::run_all(&context).await;
                    }
                }
            }
        }));

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(InflowError::Internal("reconciler not running".into()));
        }

        info!("stopping reconciler");
        self.cancellation.cancel();

        if let Some(handle) = self.task_handle.take() {
            tokio::time::timeout(self.context.config.join_timeout, handle)
                .await
                .map_err(|_| InflowError::Internal("reconciler join timeout".into()))?
                .map_err(|_| InflowError::Internal("reconciler task panicked".into()))?;
        }

        info!("reconciler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    async fn run_all(context: &ReconcilerContext) {
        let Ok(_guard) = context.run_lock.try_lock() else {
            info!("previous backfill still running, skipping this tick");
            return;
        };

        let passes = context.sources.iter().map(|source| async {
            if let Err(err) = Self::reconcile_source(context, source.as_ref()).await {
                error!(source = %source.source(), error = %err, "backfill failed");
            }
        });
        join_all(passes).await;
    }

    async fn reconcile_source(
        context: &ReconcilerContext,
        source: &dyn BackfillSource,
    ) -> Result<()> {
        let key = source.source();
        let now = Utc::now();

        let since = match context.checkpoints.get_checkpoint(key).await? {
            Some(checkpoint) => {
                checkpoint.last_event_time
                    - chrono::Duration::from_std(context.config.overlap)
                        .unwrap_or_else(|_| chrono::Duration::seconds(120))
            }
            None => {
                let start = source.initial_window_start(now);
                info!(source = %key, since = %start, "no checkpoint, starting initial window");
                start
            }
        };

        // An error here means the window must not move
        let summaries = source.fetch_updated_since(since).await?;
        info!(source = %key, since = %since, count = summaries.len(), "backfill window fetched");

        for summary in &summaries {
            let item = NewQueueItem::new(key, BACKFILL_EVENT, summary.external_id.clone());
            if let Err(err) = context.queue.enqueue(&item).await {
                // Losing the enqueue must also hold the checkpoint back,
                // or these records would silently fall out of the window.
                warn!(source = %key, external_id = %summary.external_id, error = %err, "enqueue failed, holding checkpoint");
                return Err(err);
            }
        }

        // Advance even when nothing was returned: the fetch succeeded, so
        // the window marches forward.
        let latest_seen = summaries.iter().filter_map(|summary| summary.updated_at).max();
        let advanced = latest_seen.map_or(now, |latest| latest.max(now));

        context
            .checkpoints
            .set_checkpoint(&Checkpoint::new(key, advanced))
            .await?;
        info!(source = %key, checkpoint = %advanced, "checkpoint advanced");

        Ok(())
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("reconciler dropped while running, cancelling");
            self.cancellation.cancel();
        }
    }
}
