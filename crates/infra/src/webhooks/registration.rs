//! Registers this service's webhook endpoints with the upstream systems.
//!
//! Only runs when a public base URL is configured and webhooks are enabled.
//! Registration is best effort: a failure logs manual setup instructions
//! and never blocks startup, since the backfill reconciler covers the gap.
//!
//! Created hook ids are persisted in `webhook_config` so re-registration
//! replaces old hooks instead of accumulating them at the provider.

use std::sync::Arc;
use std::time::Duration;

use inflow_core::{WebhookConfigEntry, WebhookConfigStore};
use inflow_domain::{InflowError, Result, Source, SourceConfig};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::http::client::HttpClient;

/// Tracker events this service subscribes to.
const TRACKER_EVENTS: [&str; 4] =
    ["task.created", "task.updated", "task.deleted", "task.completed"];

/// Mailbox event the single hook subscribes to.
const MAILBOX_EVENT: &str = "incoming_email";

/// Registers webhooks and persists their ids.
pub struct WebhookRegistrar {
    http: HttpClient,
    config_store: Arc<dyn WebhookConfigStore>,
}

impl WebhookRegistrar {
    pub fn new(config_store: Arc<dyn WebhookConfigStore>) -> Result<Self> {
        let http = HttpClient::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { http, config_store })
    }

    /// Ensure a tracker webhook exists per desired event. Existing hooks
    /// for our URL are updated in place.
    pub async fn register_tracker(&self, config: &SourceConfig, public_url: &str) -> bool {
        let webhook_url = format!("{}/webhook/tracker", public_url.trim_end_matches('/'));
        info!(url = %webhook_url, "registering tracker webhooks");

        match self.ensure_tracker_hooks(config, &webhook_url).await {
            Ok(hook_ids) => {
                let entry = WebhookConfigEntry {
                    source: Source::Tracker,
                    config: json!({ "webhook_ids": hook_ids }),
                    webhook_url: Some(webhook_url),
                };
                if let Err(err) = self.config_store.save(&entry).await {
                    warn!(error = %err, "could not persist tracker webhook ids");
                }
                true
            }
            Err(err) => {
                warn!(error = %err, "tracker webhook registration failed");
                log_tracker_manual_setup(&config.base_url, &webhook_url);
                false
            }
        }
    }

    async fn ensure_tracker_hooks(
        &self,
        config: &SourceConfig,
        webhook_url: &str,
    ) -> Result<Vec<Value>> {
        let base = config.base_url.trim_end_matches('/');
        let existing = self.list_tracker_hooks(base, &config.api_key).await?;

        let ours: Vec<&Value> = existing
            .iter()
            .filter(|hook| hook["url"].as_str() == Some(webhook_url))
            .collect();

        if !ours.is_empty() {
            info!(count = ours.len(), "tracker webhooks already registered, refreshing");
            for hook in &ours {
                if let Some(id) = hook["id"].as_i64() {
                    self.update_tracker_hook(base, &config.api_key, id, webhook_url).await?;
                }
            }
            return Ok(ours.iter().map(|hook| hook["id"].clone()).collect());
        }

        let mut ids = Vec::new();
        for event in TRACKER_EVENTS {
            let request = self
                .http
                .request(Method::POST, &format!("{base}/projects/api/v1/webhooks.json"))
                .basic_auth(&config.api_key, Some(""))
                .json(&json!({ "webhook": { "url": webhook_url, "event": event, "active": true } }));

            let response = self.http.send(request).await?;
            if !response.status().is_success() {
                return Err(InflowError::Network(format!(
                    "webhook create for {event} returned {}",
                    response.status()
                )));
            }
            let body: Value = response.json().await.unwrap_or(Value::Null);
            ids.push(body["webhook"]["id"].clone());
            info!(event, "created tracker webhook");
        }
        Ok(ids)
    }

    async fn list_tracker_hooks(&self, base: &str, api_key: &str) -> Result<Vec<Value>> {
        let request = self
            .http
            .request(Method::GET, &format!("{base}/projects/api/v1/webhooks.json"))
            .basic_auth(api_key, Some(""))
            .header("Accept", "application/json");

        let response = self.http.send(request).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // Not every tracker plan exposes the webhooks API
            warn!("tracker webhooks endpoint not available");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(InflowError::Network(format!(
                "webhook listing returned {}",
                response.status()
            )));
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(body["webhooks"].as_array().cloned().unwrap_or_default())
    }

    async fn update_tracker_hook(
        &self,
        base: &str,
        api_key: &str,
        hook_id: i64,
        webhook_url: &str,
    ) -> Result<()> {
        let request = self
            .http
            .request(Method::PUT, &format!("{base}/projects/api/v1/webhooks/{hook_id}.json"))
            .basic_auth(api_key, Some(""))
            .json(&json!({ "webhook": { "url": webhook_url, "active": true } }));

        let response = self.http.send(request).await?;
        if !response.status().is_success() {
            warn!(hook_id, status = response.status().as_u16(), "failed to update tracker webhook");
        }
        Ok(())
    }

    /// Replace the mailbox hook: delete the previously persisted one, then
    /// create a fresh hook for incoming email.
    pub async fn register_mailbox(&self, config: &SourceConfig, public_url: &str) -> bool {
        let webhook_url = format!("{}/webhook/mailbox", public_url.trim_end_matches('/'));
        info!(url = %webhook_url, "registering mailbox webhook");

        if let Some(old_id) = self.stored_mailbox_hook_id().await {
            self.delete_mailbox_hook(config, &old_id).await;
        }

        match self.create_mailbox_hook(config, &webhook_url).await {
            Ok(hook_id) => {
                let entry = WebhookConfigEntry {
                    source: Source::Mailbox,
                    config: json!({ "webhook_id": hook_id }),
                    webhook_url: Some(webhook_url),
                };
                if let Err(err) = self.config_store.save(&entry).await {
                    warn!(error = %err, "could not persist mailbox webhook id");
                }
                info!("mailbox webhook configured");
                true
            }
            Err(err) => {
                warn!(error = %err, "mailbox webhook registration failed");
                false
            }
        }
    }

    async fn stored_mailbox_hook_id(&self) -> Option<String> {
        match self.config_store.get(Source::Mailbox).await {
            Ok(Some(entry)) => entry.config["webhook_id"].as_str().map(str::to_string),
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "could not load stored mailbox webhook id");
                None
            }
        }
    }

    async fn delete_mailbox_hook(&self, config: &SourceConfig, hook_id: &str) {
        let base = config.base_url.trim_end_matches('/');
        let request = self
            .http
            .request(Method::DELETE, &format!("{base}/hooks/{hook_id}"))
            .bearer_auth(&config.api_key);

        match self.http.send(request).await {
            Ok(response)
                if response.status().is_success()
                    || response.status() == reqwest::StatusCode::NOT_FOUND =>
            {
                info!(hook_id, "removed previous mailbox webhook");
            }
            Ok(response) => {
                warn!(hook_id, status = response.status().as_u16(), "could not delete old mailbox webhook");
            }
            Err(err) => warn!(hook_id, error = %err, "could not delete old mailbox webhook"),
        }
    }

    async fn create_mailbox_hook(&self, config: &SourceConfig, webhook_url: &str) -> Result<String> {
        let base = config.base_url.trim_end_matches('/');
        let request = self
            .http
            .request(Method::POST, &format!("{base}/hooks"))
            .bearer_auth(&config.api_key)
            .json(&json!({ "hooks": { "type": MAILBOX_EVENT, "url": webhook_url } }));

        let response = self.http.send(request).await?;
        if !response.status().is_success() {
            return Err(InflowError::Network(format!(
                "hook create returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| InflowError::Network(format!("invalid hook response: {err}")))?;
        body["hooks"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| InflowError::Network("hook response carried no id".into()))
    }
}

fn log_tracker_manual_setup(base_url: &str, webhook_url: &str) {
    warn!("tracker webhooks need manual configuration");
    info!("go to {base_url}/settings/webhooks, add the URL {webhook_url} and select: {}", TRACKER_EVENTS.join(", "));
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[derive(Default)]
    struct MemoryConfigStore {
        entries: Mutex<Vec<WebhookConfigEntry>>,
        preset: Mutex<Option<WebhookConfigEntry>>,
    }

    #[async_trait]
    impl WebhookConfigStore for MemoryConfigStore {
        async fn get(&self, _source: Source) -> Result<Option<WebhookConfigEntry>> {
            Ok(self.preset.lock().unwrap().clone())
        }

        async fn save(&self, entry: &WebhookConfigEntry) -> Result<()> {
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    fn source_config(source: Source, base_url: &str) -> SourceConfig {
        SourceConfig {
            source,
            base_url: base_url.to_string(),
            api_key: "k".into(),
            webhook_secret: None,
            process_after: None,
        }
    }

    #[tokio::test]
    async fn tracker_creates_a_hook_per_event() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/api/v1/webhooks.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "webhooks": [] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/projects/api/v1/webhooks.json"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({ "webhook": { "id": 7 } })),
            )
            .mount(&server)
            .await;

        let store = Arc::new(MemoryConfigStore::default());
        let registrar = WebhookRegistrar::new(store.clone()).unwrap();
        let ok = registrar
            .register_tracker(&source_config(Source::Tracker, &server.uri()), "https://pub.example")
            .await;

        assert!(ok);
        let creates = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.method.as_str() == "POST")
            .count();
        assert_eq!(creates, TRACKER_EVENTS.len());

        let saved = store.entries.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(
            saved[0].webhook_url.as_deref(),
            Some("https://pub.example/webhook/tracker")
        );
    }

    #[tokio::test]
    async fn mailbox_replaces_the_stored_hook() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/hooks/old-hook"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hooks"))
            .and(body_partial_json(serde_json::json!({ "hooks": { "type": "incoming_email" } })))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({ "hooks": { "id": "new-hook" } })),
            )
            .mount(&server)
            .await;

        let store = Arc::new(MemoryConfigStore::default());
        *store.preset.lock().unwrap() = Some(WebhookConfigEntry {
            source: Source::Mailbox,
            config: serde_json::json!({ "webhook_id": "old-hook" }),
            webhook_url: None,
        });

        let registrar = WebhookRegistrar::new(store.clone()).unwrap();
        let ok = registrar
            .register_mailbox(&source_config(Source::Mailbox, &server.uri()), "https://pub.example/")
            .await;

        assert!(ok);
        let saved = store.entries.lock().unwrap();
        assert_eq!(saved[0].config["webhook_id"], "new-hook");

        let methods: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| r.method.as_str().to_string())
            .collect();
        assert!(methods.contains(&"DELETE".to_string()));
        assert!(methods.contains(&"POST".to_string()));
    }

    #[tokio::test]
    async fn registration_failure_is_reported_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryConfigStore::default());
        let registrar = WebhookRegistrar::new(store).unwrap();
        let ok = registrar
            .register_mailbox(&source_config(Source::Mailbox, &server.uri()), "https://pub.example")
            .await;

        assert!(!ok);
    }
}
