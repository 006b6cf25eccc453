//! Port interfaces for the relational record stores.
//!
//! All upserts are idempotent insert-or-update keyed by the remote record's
//! primary id; re-upserting unchanged remote state is a no-op from the
//! reader's point of view. Schema DDL is managed outside the service.

use async_trait::async_trait;
use inflow_domain::{DocumentRecord, EmailRecord, Result, Source, TaskRecord};
use serde_json::Value;

/// Task rows plus the task↔tag / task↔assignee link tables.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Upsert a batch of tasks in one round trip.
    async fn upsert_batch(&self, tasks: &[TaskRecord]) -> Result<()>;

    /// Upsert a single task (per-item fallback path).
    async fn upsert(&self, task: &TaskRecord) -> Result<()>;

    /// Soft-delete by remote id. A no-op when the row does not exist.
    async fn mark_deleted(&self, task_id: &str) -> Result<()>;

    /// Replace the task's tag links (delete-then-insert, idempotent).
    async fn link_tags(&self, task_id: &str, tag_ids: &[i64]) -> Result<()>;

    /// Replace the task's assignee links (delete-then-insert, idempotent).
    async fn link_assignees(&self, task_id: &str, user_ids: &[i64]) -> Result<()>;
}

/// Email rows.
#[async_trait]
pub trait EmailStore: Send + Sync {
    async fn upsert_batch(&self, emails: &[EmailRecord]) -> Result<()>;

    async fn upsert(&self, email: &EmailRecord) -> Result<()>;

    async fn mark_deleted(&self, email_id: &str) -> Result<()>;
}

/// Document rows.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn upsert(&self, document: &DocumentRecord) -> Result<()>;

    async fn mark_deleted(&self, document_id: &str) -> Result<()>;
}

/// A persisted webhook registration for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookConfigEntry {
    pub source: Source,
    /// Provider-specific registration payload (hook ids, event types).
    pub config: Value,
    pub webhook_url: Option<String>,
}

/// Persisted webhook registrations, so re-registration can delete stale
/// hooks instead of accumulating them.
#[async_trait]
pub trait WebhookConfigStore: Send + Sync {
    async fn get(&self, source: Source) -> Result<Option<WebhookConfigEntry>>;

    async fn save(&self, entry: &WebhookConfigEntry) -> Result<()>;
}
