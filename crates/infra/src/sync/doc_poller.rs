//! Document tree poller.
//!
//! The docs API has no delta endpoint, so reconciliation re-enumerates the
//! whole tree on its own cadence and enqueues every current document id.
//! Tombstoned documents are enqueued as delete events so the dispatcher
//! can mark the local rows. No checkpoint is involved.

use std::sync::Arc;
use std::time::Duration;

use inflow_core::WorkQueue;
use inflow_domain::{InflowError, NewQueueItem, Result, Source};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::integrations::docs::DocsClient;
use crate::integrations::value_to_string;

/// Configuration for the document poller.
#[derive(Debug, Clone)]
pub struct DocPollerConfig {
    /// Full-tree poll period.
    pub interval: Duration,
    /// Join timeout when stopping.
    pub join_timeout: Duration,
}

impl Default for DocPollerConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(300), join_timeout: Duration::from_secs(5) }
    }
}

/// Periodic full-tree document polling.
pub struct DocPoller {
    client: Arc<DocsClient>,
    queue: Arc<dyn WorkQueue>,
    config: DocPollerConfig,
    cancellation: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl DocPoller {
    pub fn new(client: Arc<DocsClient>, queue: Arc<dyn WorkQueue>, config: DocPollerConfig) -> Self {
        Self {
            client,
            queue,
            config,
            cancellation: CancellationToken::new(),
            task_handle: None,
        }
    }

    /// Enumerate the tree once and enqueue every document id.
    pub async fn poll_once(client: &DocsClient, queue: &Arc<dyn WorkQueue>) -> Result<usize> {
        let documents = client.list_documents().await?;
        let mut enqueued = 0;

        for document in &documents {
            let Some(id) = value_to_string(&document["id"]) else {
                continue;
            };
            let event_type = if document["isDeleted"].as_bool().unwrap_or(false) {
                "document.deleted"
            } else {
                "document.updated"
            };
            queue.enqueue(&NewQueueItem::new(Source::Docs, event_type, id)).await?;
            enqueued += 1;
        }

        info!(enqueued, "document poll complete");
        Ok(enqueued)
    }

    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(InflowError::Internal("doc poller already running".into()));
        }

        info!(interval_secs = self.config.interval.as_secs(), "starting doc poller");
        self.cancellation = CancellationToken::new();

        let client = Arc::clone(&self.client);
        let queue = Arc::clone(&self.queue);
        let interval = self.config.interval;
        let cancel = self.cancellation.clone();

        self.task_handle = Some(tokio::spawn(async move {
            loop {
                if let Err(err) = Self::poll_once(&client, &queue).await {
                    error!(error = %err, "document poll failed");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(interval) => {}
                }
            }
        }));

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(InflowError::Internal("doc poller not running".into()));
        }

        info!("stopping doc poller");
        self.cancellation.cancel();

        if let Some(handle) = self.task_handle.take() {
            tokio::time::timeout(self.config.join_timeout, handle)
                .await
                .map_err(|_| InflowError::Internal("doc poller join timeout".into()))?
                .map_err(|_| InflowError::Internal("doc poller task panicked".into()))?;
        }

        info!("doc poller stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for DocPoller {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("doc poller dropped while running, cancelling");
            self.cancellation.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use inflow_domain::{DocsConfig, QueueHealth, QueueItem};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[derive(Default)]
    struct MockQueue {
        enqueued: Mutex<Vec<NewQueueItem>>,
    }

    #[async_trait]
    impl WorkQueue for MockQueue {
        async fn enqueue(&self, item: &NewQueueItem) -> Result<()> {
            self.enqueued.lock().unwrap().push(item.clone());
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

    #[tokio::test]
    async fn poll_enqueues_every_current_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    { "id": "d-1", "title": "Roadmap" },
                    { "id": "d-2", "title": "Retired", "isDeleted": true },
                    { "title": "no id, skipped" }
                ]
            })))
            .mount(&server)
            .await;

        let client =
            DocsClient::new(&DocsConfig { base_url: server.uri(), webhook_secret: None }).unwrap();
        let queue: Arc<dyn WorkQueue> = Arc::new(MockQueue::default());

        let enqueued = DocPoller::poll_once(&client, &queue).await.unwrap();
        assert_eq!(enqueued, 2);
    }

    #[tokio::test]
    async fn tombstones_become_delete_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [ { "id": "d-2", "isDeleted": true } ]
            })))
            .mount(&server)
            .await;

        let client =
            DocsClient::new(&DocsConfig { base_url: server.uri(), webhook_secret: None }).unwrap();
        let mock = Arc::new(MockQueue::default());
        let queue: Arc<dyn WorkQueue> = mock.clone();

        DocPoller::poll_once(&client, &queue).await.unwrap();

        let enqueued = mock.enqueued.lock().unwrap();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].event_type, "document.deleted");
        assert_eq!(enqueued[0].source, Source::Docs);
    }
}
