//! The webhook receiver.
//!
//! One POST endpoint per source plus a health endpoint. Handlers do no
//! buffering of their own: the durable queue is the only buffer, and when
//! it is unreachable senders get a 503 and are expected to redeliver.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{SecondsFormat, Utc};
use inflow_core::{DatabaseProbe, WorkQueue};
use inflow_domain::{InflowError, NewQueueItem, Result, Source};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::parsers::WebhookParser;
use super::signature::verify_signature;

/// Shared state for the webhook handlers.
pub struct WebhookServerState {
    pub queue: Arc<dyn WorkQueue>,
    pub probe: Arc<dyn DatabaseProbe>,
    pub parsers: BTreeMap<Source, Arc<dyn WebhookParser>>,
    /// Webhook secret per source; `None` bypasses verification.
    pub secrets: BTreeMap<Source, Option<String>>,
    /// Threshold for the stuck-item count in health details.
    pub visibility_timeout_minutes: i64,
}

impl WebhookServerState {
    fn secret_for(&self, source: Source) -> Option<&str> {
        self.secrets.get(&source).and_then(|secret| secret.as_deref())
    }
}

/// The HTTP server wrapper: binds, serves, shuts down on cancellation.
pub struct WebhookServer {
    state: Arc<WebhookServerState>,
}

impl WebhookServer {
    pub fn new(state: Arc<WebhookServerState>) -> Self {
        Self { state }
    }

    /// Build the axum router; separated out so tests can drive handlers
    /// over a loopback listener.
    pub fn router(&self) -> Router {
        build_router(Arc::clone(&self.state))
    }

    /// Serve until the token is cancelled, then drain in-flight requests
    /// within the grace period.
    pub async fn serve(
        self,
        port: u16,
        shutdown: CancellationToken,
        grace: Duration,
    ) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|err| InflowError::Internal(format!("failed to bind port {port}: {err}")))?;
        info!(port, "webhook receiver listening");

        let router = self.router();
        let drain = shutdown.clone();
        let server = async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    drain.cancelled().await;
                })
                .await
        };

        // Bound the graceful drain once shutdown has been requested.
        tokio::select! {
            result = server => {
                result.map_err(|err| InflowError::Internal(format!("http server error: {err}")))
            }
            _ = async {
                shutdown.cancelled().await;
                tokio::time::sleep(grace).await;
            } => {
                warn!(grace_secs = grace.as_secs(), "grace period elapsed, dropping in-flight requests");
                Ok(())
            }
        }
    }
}

fn build_router(state: Arc<WebhookServerState>) -> Router {
    Router::new()
        .route("/webhook/{source}", post(handle_webhook))
        .route("/health", get(handle_health))
        .with_state(state)
}

async fn handle_webhook(
    State(state): State<Arc<WebhookServerState>>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(source) = source.parse::<Source>() else {
        return reply(StatusCode::NOT_FOUND, json!({ "error": "unknown source" }));
    };
    let Some(parser) = state.parsers.get(&source).cloned() else {
        return reply(StatusCode::NOT_FOUND, json!({ "error": "source not configured" }));
    };

    // Signature is computed over the raw body, before any parsing.
    let provided = signature_header(&headers, source);
    if !verify_signature(state.secret_for(source), &body, provided.as_deref()) {
        warn!(source = %source, "invalid webhook signature");
        return reply(StatusCode::UNAUTHORIZED, json!({ "error": "invalid signature" }));
    }

    if body.is_empty() {
        return reply(StatusCode::BAD_REQUEST, json!({ "error": "no data received" }));
    }

    let event = match parser.parse(&body) {
        Ok(event) => event,
        Err(err) => {
            warn!(source = %source, error = %err, "rejected webhook body");
            return reply(StatusCode::BAD_REQUEST, json!({ "error": err.to_string() }));
        }
    };

    // The payload is deliberately not enqueued: the remote record is
    // authoritative and will be re-fetched by the normalizer.
    let item = NewQueueItem::new(source, event.event_type.clone(), event.external_id.clone());
    match state.queue.enqueue(&item).await {
        Ok(()) => {
            info!(
                source = %source,
                event_type = %event.event_type,
                external_id = %event.external_id,
                "webhook accepted"
            );
            reply(StatusCode::OK, json!({ "status": "accepted" }))
        }
        Err(err) if err.is_unavailable() => {
            error!(source = %source, error = %err, "cannot enqueue webhook, database unavailable");
            reply(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "error": "service temporarily unavailable",
                    "message": "database connection unavailable, please retry later"
                }),
            )
        }
        Err(err) => {
            error!(source = %source, error = %err, "failed to enqueue webhook");
            reply(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "internal server error" }))
        }
    }
}

async fn handle_health(State(state): State<Arc<WebhookServerState>>) -> Response {
    let database_available = state.probe.is_connected().await;

    let mut queue_pending: i64 = 0;
    let mut queue_details = inflow_domain::QueueHealth::new();
    if database_available {
        match state.queue.health(state.visibility_timeout_minutes).await {
            Ok(health) => {
                queue_pending = health.values().map(|stats| stats.pending).sum();
                queue_details = health;
            }
            Err(err) => warn!(error = %err, "failed to read queue health"),
        }
    }

    let status = if database_available { "healthy" } else { "degraded" };
    reply(
        StatusCode::OK,
        json!({
            "status": status,
            "database_available": database_available,
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "queue_pending": queue_pending,
            "queue_details": queue_details,
        }),
    )
}

/// `X-<Source>-Signature` with `X-Hook-Signature` as the generic fallback.
fn signature_header(headers: &HeaderMap, source: Source) -> Option<String> {
    let specific = format!("x-{}-signature", source.as_str());
    headers
        .get(specific)
        .or_else(|| headers.get("x-hook-signature"))
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn reply(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use inflow_domain::{QueueHealth, QueueItem, SourceQueueStats};

    use super::super::parsers::default_parsers;
    use super::super::signature::sign_payload;
    use super::*;

    #[derive(Default)]
    struct MockQueue {
        enqueued: Mutex<Vec<NewQueueItem>>,
        unavailable: bool,
        pending: i64,
    }

    #[async_trait]
    impl WorkQueue for MockQueue {
        async fn enqueue(&self, item: &NewQueueItem) -> Result<()> {
            if self.unavailable {
                return Err(InflowError::DatabaseUnavailable("db down".into()));
            }
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
            let mut health = QueueHealth::new();
            health.insert(
                "tracker".into(),
                SourceQueueStats { pending: self.pending, ..Default::default() },
            );
            Ok(health)
        }
    }

    struct MockProbe(bool);

    #[async_trait]
    impl DatabaseProbe for MockProbe {
        async fn is_connected(&self) -> bool {
            self.0
        }
    }

    async fn spawn_server(queue: Arc<MockQueue>, probe_up: bool, secret: Option<&str>) -> SocketAddr {
        let mut secrets = BTreeMap::new();
        for source in Source::all() {
            secrets.insert(source, secret.map(str::to_string));
        }
        let state = Arc::new(WebhookServerState {
            queue,
            probe: Arc::new(MockProbe(probe_up)),
            parsers: default_parsers(),
            secrets,
            visibility_timeout_minutes: 30,
        });

        let router = WebhookServer::new(state).router();
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        addr
    }

    #[tokio::test]
    async fn tracker_webhook_is_accepted_and_enqueued() {
        let queue = Arc::new(MockQueue::default());
        let addr = spawn_server(queue.clone(), true, None).await;

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/webhook/tracker"))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body("Task.ID=42")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], "accepted");

        let enqueued = queue.enqueued.lock().unwrap();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].source, Source::Tracker);
        assert_eq!(enqueued[0].event_type, "task.updated");
        assert_eq!(enqueued[0].external_id, "42");
    }

    #[tokio::test]
    async fn missing_signature_is_rejected_without_enqueue() {
        let queue = Arc::new(MockQueue::default());
        let addr = spawn_server(queue.clone(), true, Some("hooksecret")).await;

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/webhook/tracker"))
            .body("Task.ID=42")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 401);
        assert!(queue.enqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn valid_signature_passes_specific_and_fallback_headers() {
        let queue = Arc::new(MockQueue::default());
        let addr = spawn_server(queue.clone(), true, Some("hooksecret")).await;
        let body = r#"{"event":"incoming_email","conversation":{"id":"c-7"}}"#;
        let signature = sign_payload("hooksecret", body.as_bytes());

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/webhook/mailbox"))
            .header("X-Mailbox-Signature", &signature)
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/webhook/mailbox"))
            .header("X-Hook-Signature", &signature)
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        assert_eq!(queue.enqueued.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_body_is_a_bad_request() {
        let queue = Arc::new(MockQueue::default());
        let addr = spawn_server(queue.clone(), true, None).await;

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/webhook/mailbox"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
        assert!(queue.enqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_source_is_not_found() {
        let queue = Arc::new(MockQueue::default());
        let addr = spawn_server(queue, true, None).await;

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/webhook/calendar"))
            .body("ID=1")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn database_outage_maps_to_service_unavailable() {
        let queue = Arc::new(MockQueue { unavailable: true, ..Default::default() });
        let addr = spawn_server(queue, false, None).await;

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/webhook/tracker"))
            .body("Task.ID=42")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 503);
    }

    #[tokio::test]
    async fn health_is_degraded_when_database_is_down() {
        let queue = Arc::new(MockQueue::default());
        let addr = spawn_server(queue, false, None).await;

        let body: serde_json::Value = reqwest::Client::new()
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["status"], "degraded");
        assert_eq!(body["database_available"], false);
        assert_eq!(body["queue_pending"], 0);
    }

    #[tokio::test]
    async fn health_reports_queue_depth_when_up() {
        let queue = Arc::new(MockQueue { pending: 5, ..Default::default() });
        let addr = spawn_server(queue, true, None).await;

        let body: serde_json::Value = reqwest::Client::new()
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["queue_pending"], 5);
        assert_eq!(body["queue_details"]["tracker"]["pending"], 5);
    }
}
