//! Fan-out from normalized records to the per-source stores.
//!
//! The dispatcher works with heterogeneous batches; this type groups them by
//! variant, forwards each group to its store in one round trip, and carries
//! the tracker's relational fan-out (tag/assignee link tables).

use std::sync::Arc;

use inflow_domain::{InflowError, Result, Source};
use tracing::debug;

use crate::normalize::DomainRecord;
use crate::store::ports::{DocumentStore, EmailStore, TaskStore};

/// The write side of the pipeline: one store per source.
pub struct RecordStores {
    tasks: Arc<dyn TaskStore>,
    emails: Arc<dyn EmailStore>,
    documents: Arc<dyn DocumentStore>,
}

impl RecordStores {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        emails: Arc<dyn EmailStore>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        Self { tasks, emails, documents }
    }

    /// Upsert a mixed batch, grouped by record kind. Batching matters for
    /// the task and email stores; documents arrive one per queue item and
    /// are written individually.
    pub async fn upsert_batch(&self, records: &[DomainRecord]) -> Result<()> {
        let mut tasks = Vec::new();
        let mut emails = Vec::new();
        let mut documents = Vec::new();

        for record in records {
            match record {
                DomainRecord::Task(task) => tasks.push(task.clone()),
                DomainRecord::Email(email) => emails.push(email.clone()),
                DomainRecord::Document(doc) => documents.push(doc),
            }
        }

        if !tasks.is_empty() {
            self.tasks.upsert_batch(&tasks).await?;
        }
        if !emails.is_empty() {
            self.emails.upsert_batch(&emails).await?;
        }
        for doc in documents {
            self.documents.upsert(doc).await?;
        }

        Ok(())
    }

    /// Upsert a single record (per-item fallback path).
    pub async fn upsert_one(&self, record: &DomainRecord) -> Result<()> {
        match record {
            DomainRecord::Task(task) => self.tasks.upsert(task).await,
            DomainRecord::Email(email) => self.emails.upsert(email).await,
            DomainRecord::Document(doc) => self.documents.upsert(doc).await,
        }
    }

    /// Link side-channel relations after the owning row exists. Only task
    /// records carry relations today.
    pub async fn link_relations(&self, record: &DomainRecord) -> Result<()> {
        if let DomainRecord::Task(task) = record {
            if !task.tag_ids_to_link.is_empty() {
                self.tasks.link_tags(&task.task_id, &task.tag_ids_to_link).await?;
            }
            if !task.assignee_user_ids_to_link.is_empty() {
                self.tasks.link_assignees(&task.task_id, &task.assignee_user_ids_to_link).await?;
            }
        }
        Ok(())
    }

    /// Route a delete sentinel to the right store.
    pub async fn mark_deleted(&self, source: Source, external_id: &str) -> Result<()> {
        debug!(source = %source, external_id, "marking record deleted");
        match source {
            Source::Tracker => self.tasks.mark_deleted(external_id).await,
            Source::Mailbox => self.emails.mark_deleted(external_id).await,
            Source::Docs => self.documents.mark_deleted(external_id).await,
        }
    }

    /// Validate that a record belongs to the source whose queue item
    /// produced it; a mismatch is a normalizer bug.
    pub fn check_source(record: &DomainRecord, expected: Source) -> Result<()> {
        if record.source() == expected {
            Ok(())
        } else {
            Err(InflowError::Internal(format!(
                "normalizer for {expected} produced a {} record",
                record.source()
            )))
        }
    }
}
