//! The normalizer contract.
//!
//! A normalizer turns a queue item back into the authoritative remote state:
//! it re-fetches the record from the source API and returns a typed domain
//! record (or a delete sentinel when the record is gone remotely). Because
//! the queue stores no payloads and provides no strict ordering, normalizers
//! always describe the *current* remote state; the idempotent upsert
//! downstream subsumes event ordering.
//!
//! Normalizers never ack queue items and never enqueue.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use inflow_domain::{DocumentRecord, EmailRecord, Result, Source, TaskRecord};

/// A normalized record tagged with its originating source.
#[derive(Debug, Clone)]
pub enum DomainRecord {
    Task(TaskRecord),
    Email(EmailRecord),
    Document(DocumentRecord),
}

impl DomainRecord {
    pub fn source(&self) -> Source {
        match self {
            Self::Task(_) => Source::Tracker,
            Self::Email(_) => Source::Mailbox,
            Self::Document(_) => Source::Docs,
        }
    }

    /// The remote primary id the upsert is keyed on.
    pub fn external_id(&self) -> &str {
        match self {
            Self::Task(task) => &task.task_id,
            Self::Email(email) => &email.email_id,
            Self::Document(doc) => &doc.id,
        }
    }
}

/// Outcome of normalizing one queue item.
#[derive(Debug, Clone)]
pub enum NormalizeResult {
    /// Records to upsert. A single queue item may expand to several records
    /// (a mailbox conversation yields one record per message).
    Records(Vec<DomainRecord>),
    /// The remote records are gone; mark these external ids deleted.
    Deleted(Vec<String>),
    /// Nothing to do (filtered out or intentionally ignored); ack the item.
    Skip,
}

/// Per-source translation of an event reference into domain records.
#[async_trait]
pub trait Normalizer: Send + Sync {
    fn source(&self) -> Source;

    /// Fetch the authoritative remote state for `external_id` and normalize
    /// it. Must map remote "not found" to [`NormalizeResult::Deleted`]
    /// rather than an error.
    async fn process(&self, event_type: &str, external_id: &str) -> Result<NormalizeResult>;
}

/// Closed map from source to its normalizer.
#[derive(Default)]
pub struct NormalizerRegistry {
    inner: BTreeMap<Source, Arc<dyn Normalizer>>,
}

impl NormalizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a normalizer under its own source key.
    pub fn register(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.inner.insert(normalizer.source(), normalizer);
        self
    }

    pub fn get(&self, source: Source) -> Option<Arc<dyn Normalizer>> {
        self.inner.get(&source).cloned()
    }
}
