//! # Inflow Infrastructure
//!
//! Infrastructure implementations of core ports.
//!
//! This crate contains:
//! - Configuration loading
//! - The resilient PostgreSQL session and repositories
//! - HTTP client wrapper and source API clients
//! - The webhook receiver (axum)
//! - Per-source normalizers
//! - Background services (dispatcher, reconciler, doc poller, cleanup)
//! - Webhook auto-registration
//!
//! ## Architecture
//! - Implements traits defined in `inflow-core`
//! - Contains all "impure" code (I/O, network, database)

pub mod config;
pub mod database;
pub mod errors;
pub mod http;
pub mod integrations;
pub mod supervisor;
pub mod sync;
pub mod webhooks;

// Re-export commonly used items
pub use database::{
    DbSession, PgCheckpointRepository, PgDocumentRepository, PgEmailRepository,
    PgQueueRepository, PgTaskRepository, PgWebhookConfigRepository,
};
pub use errors::InfraError;
pub use http::{HttpClient, HttpClientBuilder, WebhookServer, WebhookServerState};
pub use supervisor::Supervisor;
pub use sync::{
    CleanupService, CleanupServiceConfig, Dispatcher, DispatcherConfig, DocPoller,
    DocPollerConfig, Reconciler, ReconcilerConfig,
};
