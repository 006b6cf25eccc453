//! Queue dispatcher.
//!
//! Pulls batches off the durable queue, routes each item through the
//! normalizer for its source, and writes the results through the record
//! stores. Acking is driven by error class: connection loss acks nothing
//! (the visibility timeout returns the items), logic failures go back to
//! the queue's retry budget, and a poisoned record in a batch falls back
//! to per-item upserts so it cannot block the healthy ones.
//!
//! Scaling out is a matter of running more dispatchers with distinct
//! worker ids; the skip-locked dequeue keeps them from contending.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use inflow_core::{DomainRecord, NormalizeResult, NormalizerRegistry, RecordStores, WorkQueue};
use inflow_domain::{InflowError, QueueItem, Result, Source};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Lease token for this worker.
    pub worker_id: String,
    /// Items claimed per cycle.
    pub batch_size: usize,
    /// Sleep when the queue comes back empty.
    pub idle_sleep: Duration,
    /// Sleep after a cycle-level error (usually the database being down).
    pub error_backoff: Duration,
    /// Join timeout when stopping.
    pub join_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let worker_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            worker_id,
            batch_size: 10,
            idle_sleep: Duration::from_millis(500),
            error_backoff: Duration::from_secs(5),
            join_timeout: Duration::from_secs(5),
        }
    }
}

struct DispatcherContext {
    queue: Arc<dyn WorkQueue>,
    normalizers: Arc<NormalizerRegistry>,
    stores: Arc<RecordStores>,
    config: DispatcherConfig,
}

/// A normalized item waiting for its batch upsert.
struct PendingUpsert {
    item: QueueItem,
    records: Vec<DomainRecord>,
    started: Instant,
}

/// Queue worker with explicit lifecycle management.
pub struct Dispatcher {
    context: Arc<DispatcherContext>,
    cancellation: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        normalizers: Arc<NormalizerRegistry>,
        stores: Arc<RecordStores>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            context: Arc::new(DispatcherContext { queue, normalizers, stores, config }),
            cancellation: CancellationToken::new(),
            task_handle: None,
        }
    }

    /// Start the worker loop on a background task.
    #[instrument(skip(self), fields(worker_id = %self.context.config.worker_id))]
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(InflowError::Internal("dispatcher already running".into()));
        }

        info!("starting dispatcher");
        self.cancellation = CancellationToken::new();

        let context = Arc::clone(&self.context);
        let cancel = self.cancellation.clone();
        self.task_handle = Some(tokio::spawn(async move {
            Self::work_loop(context, cancel).await;
        }));

        Ok(())
    }

    /// Stop at the next cycle boundary. In-flight items stay `processing`
    /// and are reclaimed by the stuck-item sweeper on the next start.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(InflowError::Internal("dispatcher not running".into()));
        }

        info!("stopping dispatcher");
        self.cancellation.cancel();

        if let Some(handle) = self.task_handle.take() {
            let join_timeout = self.context.config.join_timeout;
            match tokio::time::timeout(join_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(error = %err, "dispatcher task panicked");
                    return Err(InflowError::Internal("dispatcher task panicked".into()));
                }
                Err(_) => {
                    warn!("dispatcher task did not stop within timeout");
                    return Err(InflowError::Internal("dispatcher join timeout".into()));
                }
            }
        }

        info!("dispatcher stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    async fn work_loop(context: Arc<DispatcherContext>, cancel: CancellationToken) {
        info!(worker_id = %context.config.worker_id, "dispatcher loop started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let pause = match Self::run_cycle(&context).await {
                Ok(0) => Some(context.config.idle_sleep),
                Ok(count) => {
                    debug!(count, "cycle processed items");
                    None
                }
                Err(err) => {
                    error!(error = %err, "dispatcher cycle failed");
                    Some(context.config.error_backoff)
                }
            };

            if let Some(duration) = pause {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(duration) => {}
                }
            }
        }

        info!("dispatcher loop exited");
    }

    /// One dequeue-process-ack cycle. Returns the number of claimed items.
    async fn run_cycle(context: &DispatcherContext) -> Result<usize> {
        let items = context
            .queue
            .dequeue_batch(&context.config.worker_id, context.config.batch_size, None)
            .await?;
        if items.is_empty() {
            return Ok(0);
        }
        let claimed = items.len();

        let mut groups: BTreeMap<Source, Vec<QueueItem>> = BTreeMap::new();
        for item in items {
            groups.entry(item.source).or_default().push(item);
        }

        for (source, group) in groups {
            Self::process_group(context, source, group).await;
        }

        Ok(claimed)
    }

    async fn process_group(context: &DispatcherContext, source: Source, items: Vec<QueueItem>) {
        let Some(normalizer) = context.normalizers.get(source) else {
            warn!(source = %source, "no normalizer registered, failing items without retry");
            for item in &items {
                Self::fail_item(context, item, "no normalizer registered for source", false).await;
            }
            return;
        };

        let mut pending: Vec<PendingUpsert> = Vec::new();

        for item in items {
            let started = Instant::now();
            match normalizer.process(&item.event_type, &item.external_id).await {
                Ok(NormalizeResult::Records(records)) => {
                    if let Some(err) = records
                        .iter()
                        .find_map(|record| RecordStores::check_source(record, source).err())
                    {
                        Self::fail_item(context, &item, &err.to_string(), false).await;
                        continue;
                    }
                    pending.push(PendingUpsert { item, records, started });
                }
                Ok(NormalizeResult::Deleted(ids)) => {
                    Self::apply_deletes(context, source, &item, &ids, started).await;
                }
                Ok(NormalizeResult::Skip) => {
                    Self::ack(context, &item, started).await;
                }
                Err(err) => {
                    // The client already retried transient failures; what
                    // reaches here goes through the queue's retry budget.
                    Self::fail_item(context, &item, &err.to_string(), true).await;
                }
            }
        }

        if pending.is_empty() {
            return;
        }

        let all_records: Vec<DomainRecord> =
            pending.iter().flat_map(|entry| entry.records.iter().cloned()).collect();

        match context.stores.upsert_batch(&all_records).await {
            Ok(()) => {
                for entry in &pending {
                    Self::finish_entry(context, entry).await;
                }
            }
            Err(err) if err.is_unavailable() => {
                // No acks: the items stay leased and the visibility sweep
                // will hand them to a future worker once the database is
                // back.
                warn!(
                    source = %source,
                    error = %err,
                    "database unavailable during batch upsert, leaving items leased"
                );
            }
            Err(err) => {
                // One poisoned record must not block the healthy ones.
                warn!(
                    source = %source,
                    error = %err,
                    "batch upsert failed, falling back to per-item upserts"
                );
                for entry in &pending {
                    if Self::upsert_single(context, entry).await.is_break() {
                        return;
                    }
                }
            }
        }
    }

    /// Link relations and ack after a successful batch upsert.
    async fn finish_entry(context: &DispatcherContext, entry: &PendingUpsert) {
        for record in &entry.records {
            match context.stores.link_relations(record).await {
                Ok(()) => {}
                Err(err) if err.is_unavailable() => {
                    warn!(item_id = entry.item.id, error = %err, "database lost while linking, leaving item leased");
                    return;
                }
                Err(err) => {
                    Self::fail_item(context, &entry.item, &err.to_string(), true).await;
                    return;
                }
            }
        }
        Self::ack(context, &entry.item, entry.started).await;
    }

    /// Per-item fallback. Records that already made it into the failed
    /// batch transaction get re-upserted here, which is safe because the
    /// upsert is idempotent. Returns `Break` when the database went away.
    async fn upsert_single(
        context: &DispatcherContext,
        entry: &PendingUpsert,
    ) -> std::ops::ControlFlow<()> {
        for record in &entry.records {
            let result = match context.stores.upsert_one(record).await {
                Ok(()) => context.stores.link_relations(record).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {}
                Err(err) if err.is_unavailable() => {
                    warn!(item_id = entry.item.id, error = %err, "database lost during fallback upsert");
                    return std::ops::ControlFlow::Break(());
                }
                Err(err) => {
                    Self::fail_item(context, &entry.item, &err.to_string(), true).await;
                    return std::ops::ControlFlow::Continue(());
                }
            }
        }
        Self::ack(context, &entry.item, entry.started).await;
        std::ops::ControlFlow::Continue(())
    }

    async fn apply_deletes(
        context: &DispatcherContext,
        source: Source,
        item: &QueueItem,
        ids: &[String],
        started: Instant,
    ) {
        for id in ids {
            match context.stores.mark_deleted(source, id).await {
                Ok(()) => {}
                Err(err) if err.is_unavailable() => {
                    warn!(item_id = item.id, error = %err, "database lost while deleting, leaving item leased");
                    return;
                }
                Err(err) => {
                    Self::fail_item(context, item, &err.to_string(), true).await;
                    return;
                }
            }
        }
        Self::ack(context, item, started).await;
    }

    async fn ack(context: &DispatcherContext, item: &QueueItem, started: Instant) {
        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        if let Err(err) = context.queue.mark_completed(item.id, Some(elapsed_ms)).await {
            warn!(item_id = item.id, error = %err, "failed to ack completed item");
        }
    }

    async fn fail_item(context: &DispatcherContext, item: &QueueItem, message: &str, retry: bool) {
        error!(
            item_id = item.id,
            external_id = %item.external_id,
            retry,
            error = message,
            "queue item failed"
        );
        if let Err(err) = context.queue.mark_failed(item.id, message, retry).await {
            warn!(item_id = item.id, error = %err, "failed to record item failure");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("dispatcher dropped while running, cancelling");
            self.cancellation.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use inflow_core::{DocumentStore, EmailStore, Normalizer, TaskStore};
    use inflow_domain::{
        DocumentRecord, EmailRecord, NewQueueItem, QueueHealth, QueueStatus, TaskRecord,
    };

    use super::*;

    // -- queue mock ---------------------------------------------------------

    #[derive(Default)]
    struct MockQueue {
        items: Mutex<Vec<QueueItem>>,
        completed: Mutex<Vec<(i64, Option<i64>)>>,
        failed: Mutex<Vec<(i64, String, bool)>>,
    }

    impl MockQueue {
        fn with_items(items: Vec<QueueItem>) -> Self {
            Self { items: Mutex::new(items), ..Default::default() }
        }

        fn completed_ids(&self) -> Vec<i64> {
            self.completed.lock().unwrap().iter().map(|(id, _)| *id).collect()
        }

        fn failed_entries(&self) -> Vec<(i64, String, bool)> {
            self.failed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkQueue for MockQueue {
        async fn enqueue(&self, _item: &NewQueueItem) -> Result<()> {
            Ok(())
        }

        async fn dequeue_batch(
            &self,
            _worker_id: &str,
            max_items: usize,
            _source: Option<Source>,
        ) -> Result<Vec<QueueItem>> {
            let mut items = self.items.lock().unwrap();
            let take = max_items.min(items.len());
            Ok(items.drain(..take).collect())
        }

        async fn mark_completed(&self, id: i64, processing_time_ms: Option<i64>) -> Result<()> {
            self.completed.lock().unwrap().push((id, processing_time_ms));
            Ok(())
        }

        async fn mark_failed(&self, id: i64, error: &str, retry: bool) -> Result<()> {
            self.failed.lock().unwrap().push((id, error.to_string(), retry));
            Ok(())
        }

        async fn reset_stuck_items(&self, _minutes: i64) -> Result<u64> {
            Ok(0)
        }

        async fn cleanup_completed(&self, _days: i64) -> Result<u64> {
            Ok(0)
        }

        async fn health(&self, _minutes: i64) -> Result<QueueHealth> {
            Ok(QueueHealth::new())
        }
    }

    // -- store mocks --------------------------------------------------------

    #[derive(Default)]
    struct MockStoreState {
        batch_upserts: Mutex<Vec<usize>>,
        single_upserts: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
        linked: Mutex<Vec<String>>,
        /// Batch upserts fail with this error when set.
        batch_error: Option<InflowError>,
        /// Single upserts fail for this task id.
        poisoned_id: Option<String>,
    }

    struct MockTasks(Arc<MockStoreState>);

    #[async_trait]
    impl TaskStore for MockTasks {
        async fn upsert_batch(&self, tasks: &[TaskRecord]) -> Result<()> {
            if let Some(err) = &self.0.batch_error {
                return Err(clone_error(err));
            }
            self.0.batch_upserts.lock().unwrap().push(tasks.len());
            Ok(())
        }

        async fn upsert(&self, task: &TaskRecord) -> Result<()> {
            if self.0.poisoned_id.as_deref() == Some(task.task_id.as_str()) {
                return Err(InflowError::Database("null value in column title".into()));
            }
            self.0.single_upserts.lock().unwrap().push(task.task_id.clone());
            Ok(())
        }

        async fn mark_deleted(&self, task_id: &str) -> Result<()> {
            self.0.deleted.lock().unwrap().push(task_id.to_string());
            Ok(())
        }

        async fn link_tags(&self, task_id: &str, _tag_ids: &[i64]) -> Result<()> {
            self.0.linked.lock().unwrap().push(format!("tags:{task_id}"));
            Ok(())
        }

        async fn link_assignees(&self, task_id: &str, _user_ids: &[i64]) -> Result<()> {
            self.0.linked.lock().unwrap().push(format!("assignees:{task_id}"));
            Ok(())
        }
    }

    struct MockEmails;

    #[async_trait]
    impl EmailStore for MockEmails {
        async fn upsert_batch(&self, _emails: &[EmailRecord]) -> Result<()> {
            Ok(())
        }

        async fn upsert(&self, _email: &EmailRecord) -> Result<()> {
            Ok(())
        }

        async fn mark_deleted(&self, _email_id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct MockDocs;

    #[async_trait]
    impl DocumentStore for MockDocs {
        async fn upsert(&self, _document: &DocumentRecord) -> Result<()> {
            Ok(())
        }

        async fn mark_deleted(&self, _document_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn clone_error(err: &InflowError) -> InflowError {
        match err {
            InflowError::DatabaseUnavailable(msg) => {
                InflowError::DatabaseUnavailable(msg.clone())
            }
            other => InflowError::Database(other.to_string()),
        }
    }

    // -- normalizer mock ----------------------------------------------------

    struct ScriptedNormalizer {
        source: Source,
        results: Mutex<BTreeMap<String, NormalizeResult>>,
    }

    impl ScriptedNormalizer {
        fn new(source: Source, scripted: Vec<(&str, NormalizeResult)>) -> Self {
            let results = scripted
                .into_iter()
                .map(|(id, result)| (id.to_string(), result))
                .collect();
            Self { source, results: Mutex::new(results) }
        }
    }

    #[async_trait]
    impl Normalizer for ScriptedNormalizer {
        fn source(&self) -> Source {
            self.source
        }

        async fn process(&self, _event_type: &str, external_id: &str) -> Result<NormalizeResult> {
            match self.results.lock().unwrap().remove(external_id) {
                Some(result) => Ok(result),
                None => Err(InflowError::Network(format!("no fixture for {external_id}"))),
            }
        }
    }

    // -- helpers ------------------------------------------------------------

    fn queue_item(id: i64, source: Source, external_id: &str) -> QueueItem {
        QueueItem {
            id,
            source,
            event_type: "task.updated".into(),
            external_id: external_id.into(),
            status: QueueStatus::Processing,
            retry_count: 0,
            next_retry_at: Utc::now(),
            claimed_by: Some("w1".into()),
            claimed_at: Some(Utc::now()),
            created_at: Utc::now(),
            completed_at: None,
            last_error: None,
            processing_time_ms: None,
        }
    }

    fn task_result(id: &str, tag_ids: Vec<i64>) -> NormalizeResult {
        NormalizeResult::Records(vec![DomainRecord::Task(TaskRecord {
            task_id: id.into(),
            tag_ids_to_link: tag_ids,
            ..Default::default()
        })])
    }

    fn build_context(
        queue: Arc<MockQueue>,
        state: Arc<MockStoreState>,
        normalizer: ScriptedNormalizer,
    ) -> DispatcherContext {
        let stores = Arc::new(RecordStores::new(
            Arc::new(MockTasks(state)),
            Arc::new(MockEmails),
            Arc::new(MockDocs),
        ));
        let normalizers = Arc::new(NormalizerRegistry::new().register(Arc::new(normalizer)));
        DispatcherContext {
            queue,
            normalizers,
            stores,
            config: DispatcherConfig { worker_id: "w1".into(), ..Default::default() },
        }
    }

    // -- tests --------------------------------------------------------------

    #[tokio::test]
    async fn happy_path_upserts_links_and_acks() {
        let queue = Arc::new(MockQueue::with_items(vec![
            queue_item(1, Source::Tracker, "42"),
            queue_item(2, Source::Tracker, "43"),
        ]));
        let state = Arc::new(MockStoreState::default());
        let normalizer = ScriptedNormalizer::new(
            Source::Tracker,
            vec![("42", task_result("42", vec![3])), ("43", task_result("43", vec![]))],
        );
        let context = build_context(queue.clone(), state.clone(), normalizer);

        let claimed = Dispatcher::run_cycle(&context).await.unwrap();
        assert_eq!(claimed, 2);

        assert_eq!(*state.batch_upserts.lock().unwrap(), vec![2]);
        assert_eq!(*state.linked.lock().unwrap(), vec!["tags:42"]);
        assert_eq!(queue.completed_ids(), vec![1, 2]);
        assert!(queue.failed_entries().is_empty());

        let completed = queue.completed.lock().unwrap();
        assert!(completed.iter().all(|(_, ms)| ms.is_some()));
    }

    #[tokio::test]
    async fn skip_results_ack_without_touching_stores() {
        let queue = Arc::new(MockQueue::with_items(vec![queue_item(1, Source::Tracker, "42")]));
        let state = Arc::new(MockStoreState::default());
        let normalizer =
            ScriptedNormalizer::new(Source::Tracker, vec![("42", NormalizeResult::Skip)]);
        let context = build_context(queue.clone(), state.clone(), normalizer);

        Dispatcher::run_cycle(&context).await.unwrap();

        assert!(state.batch_upserts.lock().unwrap().is_empty());
        assert_eq!(queue.completed_ids(), vec![1]);
    }

    #[tokio::test]
    async fn delete_sentinel_marks_deleted_then_acks() {
        let queue = Arc::new(MockQueue::with_items(vec![queue_item(1, Source::Tracker, "42")]));
        let state = Arc::new(MockStoreState::default());
        let normalizer = ScriptedNormalizer::new(
            Source::Tracker,
            vec![("42", NormalizeResult::Deleted(vec!["42".into()]))],
        );
        let context = build_context(queue.clone(), state.clone(), normalizer);

        Dispatcher::run_cycle(&context).await.unwrap();

        assert_eq!(*state.deleted.lock().unwrap(), vec!["42"]);
        assert_eq!(queue.completed_ids(), vec![1]);
    }

    #[tokio::test]
    async fn normalizer_errors_go_to_the_retry_budget() {
        let queue = Arc::new(MockQueue::with_items(vec![queue_item(1, Source::Tracker, "nope")]));
        let state = Arc::new(MockStoreState::default());
        let normalizer = ScriptedNormalizer::new(Source::Tracker, vec![]);
        let context = build_context(queue.clone(), state, normalizer);

        Dispatcher::run_cycle(&context).await.unwrap();

        let failed = queue.failed_entries();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, 1);
        assert!(failed[0].2, "normalizer errors must be retryable");
        assert!(queue.completed_ids().is_empty());
    }

    #[tokio::test]
    async fn poisoned_record_falls_back_to_per_item_upserts() {
        let queue = Arc::new(MockQueue::with_items(vec![
            queue_item(1, Source::Tracker, "good"),
            queue_item(2, Source::Tracker, "BAD"),
        ]));
        let state = Arc::new(MockStoreState {
            batch_error: Some(InflowError::Database("constraint violation".into())),
            poisoned_id: Some("BAD".into()),
            ..Default::default()
        });
        let normalizer = ScriptedNormalizer::new(
            Source::Tracker,
            vec![("good", task_result("good", vec![])), ("BAD", task_result("BAD", vec![]))],
        );
        let context = build_context(queue.clone(), state.clone(), normalizer);

        Dispatcher::run_cycle(&context).await.unwrap();

        // The good item survives the poisoned batch
        assert_eq!(*state.single_upserts.lock().unwrap(), vec!["good"]);
        assert_eq!(queue.completed_ids(), vec![1]);

        let failed = queue.failed_entries();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, 2);
        assert!(failed[0].2);
    }

    #[tokio::test]
    async fn database_outage_acks_nothing() {
        let queue = Arc::new(MockQueue::with_items(vec![
            queue_item(1, Source::Tracker, "42"),
            queue_item(2, Source::Tracker, "43"),
        ]));
        let state = Arc::new(MockStoreState {
            batch_error: Some(InflowError::DatabaseUnavailable("connection reset".into())),
            ..Default::default()
        });
        let normalizer = ScriptedNormalizer::new(
            Source::Tracker,
            vec![("42", task_result("42", vec![])), ("43", task_result("43", vec![]))],
        );
        let context = build_context(queue.clone(), state, normalizer);

        Dispatcher::run_cycle(&context).await.unwrap();

        assert!(queue.completed_ids().is_empty());
        assert!(queue.failed_entries().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_starts_and_stops() {
        let queue = Arc::new(MockQueue::default());
        let state = Arc::new(MockStoreState::default());
        let normalizer = ScriptedNormalizer::new(Source::Tracker, vec![]);
        let context = build_context(queue, state, normalizer);

        let stores = Arc::clone(&context.stores);
        let normalizers = Arc::clone(&context.normalizers);
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&context.queue),
            normalizers,
            stores,
            DispatcherConfig { idle_sleep: Duration::from_millis(10), ..Default::default() },
        );

        assert!(!dispatcher.is_running());
        dispatcher.start().unwrap();
        assert!(dispatcher.is_running());
        assert!(dispatcher.start().is_err());

        dispatcher.stop().await.unwrap();
        assert!(!dispatcher.is_running());
    }
}
