//! Mailbox API client.
//!
//! The mailbox API has no server-side updated-since filter; the listing
//! walks conversations newest-first with an `until` cursor and filters
//! client-side on `last_activity_at`, stopping once a page reaches past
//! the window start.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inflow_core::{BackfillSource, RemoteSummary};
use inflow_domain::utils::timestamps::from_unix_magnitude;
use inflow_domain::{InflowError, Result, Source, SourceConfig};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info};

use crate::http::client::{ensure_success, HttpClient};
use crate::integrations::value_to_string;

const PAGE_LIMIT: usize = 50;
/// Default lookback for the first sync when no process-after is set.
const DEFAULT_LOOKBACK_DAYS: i64 = 30;

/// Client for the mailbox API.
pub struct MailboxClient {
    http: HttpClient,
    base_url: String,
    api_token: String,
}

impl MailboxClient {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let http = HttpClient::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_key.clone(),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(Method::GET, &format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_token)
            .header("Accept", "application/json")
    }

    /// Conversations whose last activity is at or after `since`.
    pub async fn get_conversations_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Value>> {
        let mut conversations = Vec::new();
        let mut until: Option<i64> = None;

        loop {
            let limit = PAGE_LIMIT.to_string();
            let mut request =
                self.get("/conversations").query(&[("all", "true"), ("limit", limit.as_str())]);
            if let Some(cursor) = until {
                request = request.query(&[("until", cursor.to_string())]);
            }

            let response = ensure_success(self.http.send(request).await?).await?;
            let body: Value = response.json().await.map_err(|err| {
                InflowError::Network(format!("invalid conversation listing: {err}"))
            })?;

            let batch = body["conversations"].as_array().cloned().unwrap_or_default();
            if batch.is_empty() {
                break;
            }

            let mut oldest: Option<i64> = None;
            let mut reached_window_start = false;
            for conversation in &batch {
                let raw_activity = conversation["last_activity_at"].as_i64().unwrap_or(0);
                oldest = Some(oldest.map_or(raw_activity, |prev| prev.min(raw_activity)));

                match from_unix_magnitude(raw_activity) {
                    Some(activity) if activity >= since => {
                        conversations.push(conversation.clone())
                    }
                    _ => reached_window_start = true,
                }
            }

            debug!(count = batch.len(), kept = conversations.len(), "fetched conversation page");

            if batch.len() < PAGE_LIMIT || reached_window_start {
                break;
            }
            until = oldest;
        }

        info!(count = conversations.len(), "mailbox listing complete");
        Ok(conversations)
    }

    /// One conversation, `None` when it no longer exists.
    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Value>> {
        let response = self.http.send(self.get(&format!("/conversations/{conversation_id}"))).await?;
        let response = match ensure_success(response).await {
            Ok(response) => response,
            Err(InflowError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let body: Value = response
            .json()
            .await
            .map_err(|err| InflowError::Network(format!("invalid conversation: {err}")))?;
        let conversation = body.get("conversations").cloned().unwrap_or(Value::Null);
        Ok(if conversation.is_null() { None } else { Some(conversation) })
    }

    /// All messages in a conversation. A vanished conversation yields an
    /// empty list.
    pub async fn get_conversation_messages(&self, conversation_id: &str) -> Result<Vec<Value>> {
        let response = self
            .http
            .send(self.get(&format!("/conversations/{conversation_id}/messages")))
            .await?;
        let response = match ensure_success(response).await {
            Ok(response) => response,
            Err(InflowError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let body: Value = response
            .json()
            .await
            .map_err(|err| InflowError::Network(format!("invalid message listing: {err}")))?;
        Ok(body["messages"].as_array().cloned().unwrap_or_default())
    }

    /// Full message detail; the listing only carries a body preview.
    pub async fn get_message(&self, message_id: &str) -> Result<Option<Value>> {
        let response = self.http.send(self.get(&format!("/messages/{message_id}"))).await?;
        let response = match ensure_success(response).await {
            Ok(response) => response,
            Err(InflowError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let body: Value = response
            .json()
            .await
            .map_err(|err| InflowError::Network(format!("invalid message: {err}")))?;
        let message = body.get("messages").cloned().unwrap_or(Value::Null);
        Ok(if message.is_null() { None } else { Some(message) })
    }
}

/// Backfill adapter over the conversation listing.
pub struct MailboxBackfill {
    client: std::sync::Arc<MailboxClient>,
    process_after: Option<DateTime<Utc>>,
}

impl MailboxBackfill {
    pub fn new(client: std::sync::Arc<MailboxClient>, process_after: Option<DateTime<Utc>>) -> Self {
        Self { client, process_after }
    }
}

#[async_trait]
impl BackfillSource for MailboxBackfill {
    fn source(&self) -> Source {
        Source::Mailbox
    }

    fn initial_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.process_after
            .unwrap_or_else(|| now - chrono::Duration::days(DEFAULT_LOOKBACK_DAYS))
    }

    async fn fetch_updated_since(&self, since: DateTime<Utc>) -> Result<Vec<RemoteSummary>> {
        let conversations = self.client.get_conversations_updated_since(since).await?;
        Ok(conversations
            .iter()
            .filter_map(|conversation| {
                let external_id = value_to_string(&conversation["id"])?;
                let updated_at = conversation["last_activity_at"]
                    .as_i64()
                    .and_then(from_unix_magnitude);
                Some(RemoteSummary { external_id, updated_at })
            })
            .collect())
    }
}
