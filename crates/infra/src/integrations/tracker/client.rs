//! Task tracker API client.
//!
//! Thin wrapper over the tracker's v3 REST API: single-task fetch with
//! included side resources, and a paged updated-since listing used by the
//! backfill reconciler. Authentication is HTTP basic with the API key as
//! the username.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use inflow_core::{BackfillSource, RemoteSummary};
use inflow_domain::{InflowError, Result, Source, SourceConfig};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info};

use crate::http::client::{ensure_success, HttpClient};
use crate::integrations::{parse_datetime, value_to_string};

const PAGE_SIZE: usize = 100;
/// Side resources requested with every task fetch; the normalizer resolves
/// names and relations from these maps.
const TASK_INCLUDES: &str = "projects,tasklists,users,companies,teams,tags";
/// Default lookback for the very first sync when no process-after date is
/// configured: effectively "everything" (15 years).
const DEFAULT_LOOKBACK_DAYS: i64 = 5475;

/// A task plus the included side resources it references.
#[derive(Debug, Clone)]
pub struct TrackerTaskResponse {
    pub task: Value,
    pub included: Value,
}

/// Client for the task tracker API.
pub struct TrackerClient {
    http: HttpClient,
    base_url: String,
    api_key: String,
}

impl TrackerClient {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let http = HttpClient::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    /// Fetch one task with its included resources. `None` when the task no
    /// longer exists remotely.
    pub async fn get_task(&self, task_id: &str) -> Result<Option<TrackerTaskResponse>> {
        let url = format!("{}/projects/api/v3/tasks/{task_id}.json", self.base_url);
        let request = self
            .http
            .request(Method::GET, &url)
            .basic_auth(&self.api_key, Some(""))
            .header("Accept", "application/json")
            .query(&[("include", TASK_INCLUDES)]);

        let response = self.http.send(request).await?;
        let response = match ensure_success(response).await {
            Ok(response) => response,
            Err(InflowError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        let body: Value = response
            .json()
            .await
            .map_err(|err| InflowError::Network(format!("invalid task response: {err}")))?;

        let task = body.get("task").cloned().unwrap_or(Value::Null);
        if task.is_null() {
            return Ok(None);
        }
        let included = body.get("included").cloned().unwrap_or_else(|| Value::Object(Default::default()));
        Ok(Some(TrackerTaskResponse { task, included }))
    }

    /// List all tasks updated after `since`, paging until exhausted.
    /// Completed tasks are always included so status flips are captured.
    pub async fn get_tasks_updated_since(&self, since: DateTime<Utc>) -> Result<Vec<Value>> {
        let updated_after = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut tasks = Vec::new();
        let mut page: usize = 1;

        loop {
            let url = format!("{}/projects/api/v3/tasks.json", self.base_url);
            let request = self
                .http
                .request(Method::GET, &url)
                .basic_auth(&self.api_key, Some(""))
                .header("Accept", "application/json")
                .query(&[
                    ("page", page.to_string()),
                    ("pageSize", PAGE_SIZE.to_string()),
                    ("updatedAfter", updated_after.clone()),
                    ("includeCompletedTasks", "true".into()),
                    ("includeArchivedProjects", "true".into()),
                ]);

            let response = ensure_success(self.http.send(request).await?).await?;
            let body: Value = response
                .json()
                .await
                .map_err(|err| InflowError::Network(format!("invalid task listing: {err}")))?;

            let batch = body["tasks"].as_array().cloned().unwrap_or_default();
            let batch_len = batch.len();
            debug!(page, count = batch_len, "fetched tracker task page");
            tasks.extend(batch);

            if batch_len < PAGE_SIZE {
                break;
            }
            page += 1;
        }

        info!(count = tasks.len(), since = %updated_after, "tracker listing complete");
        Ok(tasks)
    }

    /// Best-effort human web URL for a task.
    pub fn build_task_web_url(&self, task_id: &str) -> String {
        format!("{}/#/tasks/{task_id}", self.base_url)
    }
}

/// Backfill adapter over the tracker listing endpoint.
pub struct TrackerBackfill {
    client: std::sync::Arc<TrackerClient>,
    process_after: Option<DateTime<Utc>>,
}

impl TrackerBackfill {
    pub fn new(client: std::sync::Arc<TrackerClient>, process_after: Option<DateTime<Utc>>) -> Self {
        Self { client, process_after }
    }
}

#[async_trait]
impl BackfillSource for TrackerBackfill {
    fn source(&self) -> Source {
        Source::Tracker
    }

    fn initial_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.process_after
            .unwrap_or_else(|| now - chrono::Duration::days(DEFAULT_LOOKBACK_DAYS))
    }

    async fn fetch_updated_since(&self, since: DateTime<Utc>) -> Result<Vec<RemoteSummary>> {
        let tasks = self.client.get_tasks_updated_since(since).await?;
        Ok(tasks
            .iter()
            .filter_map(|task| {
                let external_id = value_to_string(&task["id"])?;
                Some(RemoteSummary { external_id, updated_at: parse_datetime(&task["updatedAt"]) })
            })
            .collect())
    }
}
