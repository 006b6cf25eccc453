//! Document event normalization.
//!
//! The queue item carries only the document id; metadata comes from the
//! search endpoint and the body from the blocks endpoint, with the
//! XML-markdown mix flattened to clean markdown.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use inflow_core::{DomainRecord, NormalizeResult, Normalizer};
use inflow_domain::{flatten_markdown, DocumentRecord, Result, Source};
use serde_json::Value;
use tracing::{debug, info};

use super::client::DocsClient;
use crate::integrations::parse_datetime;

/// Normalizer for the document store.
pub struct DocsNormalizer {
    client: Arc<DocsClient>,
}

impl DocsNormalizer {
    pub fn new(client: Arc<DocsClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Normalizer for DocsNormalizer {
    fn source(&self) -> Source {
        Source::Docs
    }

    async fn process(&self, event_type: &str, external_id: &str) -> Result<NormalizeResult> {
        debug!(event_type, external_id, "processing document event");

        if event_type == "document.deleted" {
            return Ok(NormalizeResult::Deleted(vec![external_id.to_string()]));
        }

        let Some(metadata) = self.client.find_document(external_id).await? else {
            info!(external_id, "document gone remotely, marking deleted");
            return Ok(NormalizeResult::Deleted(vec![external_id.to_string()]));
        };

        if metadata["isDeleted"].as_bool().unwrap_or(false) {
            return Ok(NormalizeResult::Deleted(vec![external_id.to_string()]));
        }

        // Metadata survives even when the content fetch comes back empty.
        let markdown_content = self
            .client
            .get_document_content(external_id)
            .await?
            .filter(|content| !content.is_empty())
            .map(|content| flatten_markdown(&content));

        Ok(NormalizeResult::Records(vec![DomainRecord::Document(parse_document(
            external_id,
            &metadata,
            markdown_content,
        ))]))
    }
}

fn parse_document(
    document_id: &str,
    metadata: &Value,
    markdown_content: Option<String>,
) -> DocumentRecord {
    DocumentRecord {
        id: document_id.to_string(),
        title: metadata["title"].as_str().map(str::to_string),
        markdown_content,
        is_deleted: metadata["isDeleted"].as_bool().unwrap_or(false),
        folder_path: metadata["folder_path"]
            .as_str()
            .or_else(|| metadata["folderPath"].as_str())
            .map(str::to_string),
        folder_id: metadata["folder_id"]
            .as_str()
            .or_else(|| metadata["folderId"].as_str())
            .map(str::to_string),
        location: metadata["location"].as_str().map(str::to_string),
        daily_note_date: metadata["daily_note_date"]
            .as_str()
            .or_else(|| metadata["dailyNoteDate"].as_str())
            .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()),
        last_modified_at: parse_datetime(&metadata["lastModifiedAt"]),
        created_at: parse_datetime(&metadata["createdAt"]),
        raw: metadata.clone(),
    }
}
