//! Application configuration structures.
//!
//! Populated by the infra config loader from environment variables; see the
//! loader for the key table and defaults. All durations are resolved here so
//! downstream code never re-parses strings.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::queue::Source;

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Listen port for the webhook receiver.
    pub port: u16,
    /// Grace period for in-flight requests on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 8080, shutdown_grace: Duration::from_secs(30) }
    }
}

/// Database session settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Connection string (`postgres://...`).
    pub dsn: String,
    /// Initial connect timeout.
    pub connect_timeout: Duration,
    /// Per-operation retry count on classified connection errors.
    pub operation_retries: u32,
    /// Initial reconnect backoff.
    pub reconnect_delay: Duration,
    /// Reconnect backoff cap.
    pub max_reconnect_delay: Duration,
}

impl DatabaseConfig {
    /// Sensible defaults around a DSN.
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            connect_timeout: Duration::from_secs(10),
            operation_retries: 3,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

/// Durable queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Failures before an item moves to `dead_letter`.
    pub max_attempts: i32,
    /// Base of the exponential retry backoff.
    pub retry_base: Duration,
    /// Per-source ceiling for the retry backoff.
    pub retry_cap: Duration,
    /// Minutes after which a `processing` item is considered lost.
    pub visibility_timeout_minutes: i64,
    /// Days to keep `completed` rows before cleanup.
    pub retention_days: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base: Duration::from_secs(60),
            retry_cap: Duration::from_secs(3600),
            visibility_timeout_minutes: 30,
            retention_days: 7,
        }
    }
}

/// Backfill reconciliation settings.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Overlap window subtracted from the checkpoint on each poll.
    pub overlap: Duration,
    /// Reconciler period.
    pub interval: Duration,
    /// Pure-polling mode: webhooks are neither registered nor expected.
    pub disable_webhooks: bool,
    /// Document tree poll period.
    pub doc_poll_interval: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            overlap: Duration::from_secs(120),
            interval: Duration::from_secs(60),
            disable_webhooks: false,
            doc_poll_interval: Duration::from_secs(300),
        }
    }
}

/// Per-source credentials and filters.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub source: Source,
    pub base_url: String,
    pub api_key: String,
    /// Shared webhook secret; verification is bypassed when absent.
    pub webhook_secret: Option<String>,
    /// Ignore remote records created before this instant.
    pub process_after: Option<DateTime<Utc>>,
}

/// Document source settings. The docs API is unauthenticated per-link and
/// has no delta endpoint, hence the separate poll cadence.
#[derive(Debug, Clone)]
pub struct DocsConfig {
    pub base_url: String,
    pub webhook_secret: Option<String>,
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub backfill: BackfillConfig,
    pub tracker: SourceConfig,
    pub mailbox: SourceConfig,
    pub docs: Option<DocsConfig>,
    /// IANA timezone used to interpret local process-after dates.
    pub timezone: String,
    /// Public base URL for webhook auto-registration, when reachable.
    pub public_url: Option<String>,
}
