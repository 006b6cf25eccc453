//! Normalized domain records.
//!
//! These are the outputs of the per-source normalizers: transient values
//! built from the authoritative remote state, consumed by an idempotent
//! upsert, then discarded. Every record carries the raw API payload for
//! archival.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A task from the tracker source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub tasklist_id: Option<String>,
    pub tasklist_name: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub progress: Option<i32>,
    /// Resolved tag names, in upstream order.
    pub tags: Vec<String>,
    /// Resolved assignee display names (users, companies or teams).
    pub assignees: Vec<String>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Links back into the source system, e.g. a web URL.
    pub source_links: BTreeMap<String, String>,
    /// Raw API payload, passed through to storage for archival.
    pub raw: serde_json::Value,
    /// Tag ids to link in `task_tags` after the task row is upserted.
    /// Side channel from the normalizer to the dispatcher's relational
    /// fan-out; never persisted on the task row itself.
    #[serde(skip)]
    pub tag_ids_to_link: Vec<i64>,
    /// Assignee user ids to link in `task_assignees` after the task upsert.
    #[serde(skip)]
    pub assignee_user_ids_to_link: Vec<i64>,
}

/// An email attachment reference. The binary content stays in the source
/// system; only metadata is stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub byte_size: i64,
    pub source_url: String,
    pub checksum: Option<String>,
}

/// An email message from the mailbox source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailRecord {
    pub email_id: String,
    pub thread_id: Option<String>,
    pub subject: Option<String>,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    /// Recipient addresses; `to_names` is the parallel display-name sequence
    /// (empty string where the upstream had none).
    pub to_addresses: Vec<String>,
    pub to_names: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub cc_names: Vec<String>,
    pub bcc_addresses: Vec<String>,
    pub bcc_names: Vec<String>,
    pub in_reply_to: Vec<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    /// Conversation-level labels; messages inherit them.
    pub labels: Vec<String>,
    pub draft: bool,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub source_links: BTreeMap<String, String>,
    pub attachments: Vec<Attachment>,
    pub raw: serde_json::Value,
}

/// A document from the docs source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub title: Option<String>,
    pub markdown_content: Option<String>,
    pub is_deleted: bool,
    pub folder_path: Option<String>,
    pub folder_id: Option<String>,
    pub location: Option<String>,
    pub daily_note_date: Option<NaiveDate>,
    pub last_modified_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
}
