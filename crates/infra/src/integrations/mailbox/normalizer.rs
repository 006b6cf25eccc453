//! Mailbox event normalization.
//!
//! A queue item references a conversation; the normalizer re-fetches the
//! conversation (labels live there, not on messages) and every message in
//! it, pulling full message bodies because the listing only carries
//! previews. One conversation expands to one email record per message.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inflow_core::{DomainRecord, NormalizeResult, Normalizer};
use inflow_domain::{html_to_text, Attachment, EmailRecord, Result, Source};
use inflow_domain::utils::timestamps::from_unix_magnitude;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::client::MailboxClient;
use crate::integrations::{parse_datetime_str, value_to_string};

/// Normalizer for the shared mailbox.
pub struct MailboxNormalizer {
    client: Arc<MailboxClient>,
}

impl MailboxNormalizer {
    pub fn new(client: Arc<MailboxClient>) -> Self {
        Self { client }
    }

    /// Conversation-level labels arrive as one comma-separated string.
    async fn fetch_conversation_labels(&self, conversation_id: &str) -> Vec<String> {
        match self.client.get_conversation(conversation_id).await {
            Ok(Some(conversation)) => conversation["shared_label_names"]
                .as_str()
                .map(|names| {
                    names
                        .split(',')
                        .map(str::trim)
                        .filter(|label| !label.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(conversation_id, error = %err, "failed to fetch conversation labels");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Normalizer for MailboxNormalizer {
    fn source(&self) -> Source {
        Source::Mailbox
    }

    async fn process(&self, event_type: &str, external_id: &str) -> Result<NormalizeResult> {
        debug!(event_type, external_id, "processing mailbox event");

        let lowered = event_type.to_ascii_lowercase();
        if lowered.contains("deleted") || lowered.contains("trashed") {
            // Resolve the conversation to its message ids first; those are
            // the rows that exist locally.
            let messages = self.client.get_conversation_messages(external_id).await?;
            let ids = messages.iter().filter_map(|m| value_to_string(&m["id"])).collect();
            return Ok(NormalizeResult::Deleted(ids));
        }

        let labels = self.fetch_conversation_labels(external_id).await;
        let messages = self.client.get_conversation_messages(external_id).await?;
        if messages.is_empty() {
            info!(external_id, "conversation has no messages, nothing to upsert");
            return Ok(NormalizeResult::Skip);
        }

        let mut emails = Vec::with_capacity(messages.len());
        for message in &messages {
            let Some(message_id) = value_to_string(&message["id"]) else {
                continue;
            };
            // The listing carries previews only; the detail endpoint has
            // the complete body.
            let detail = self.client.get_message(&message_id).await?;
            let data = detail.as_ref().unwrap_or(message);
            emails.push(parse_message(data, external_id, &labels));
        }

        if emails.is_empty() {
            Ok(NormalizeResult::Skip)
        } else {
            Ok(NormalizeResult::Records(emails.into_iter().map(DomainRecord::Email).collect()))
        }
    }
}

fn parse_message(data: &Value, conversation_id: &str, labels: &[String]) -> EmailRecord {
    let message_id = value_to_string(&data["id"]).unwrap_or_default();

    let sent_at = parse_message_time(&data["delivered_at"]);
    let received_at = sent_at.or_else(|| parse_message_time(&data["created_at"]));

    let (from_address, from_name) = parse_single_address(
        data.get("from_field").unwrap_or_else(|| &data["from"]),
    );

    let (to_addresses, to_names) =
        parse_address_fields(data.get("to_fields").unwrap_or_else(|| &data["to"]));
    let (cc_addresses, cc_names) =
        parse_address_fields(data.get("cc_fields").unwrap_or_else(|| &data["cc"]));
    let (bcc_addresses, bcc_names) =
        parse_address_fields(data.get("bcc_fields").unwrap_or_else(|| &data["bcc"]));

    let in_reply_to = match &data["in_reply_to"] {
        Value::Array(items) => items.iter().filter_map(value_to_string).collect(),
        other => value_to_string(other).into_iter().collect(),
    };

    // The API returns HTML in `body`; the plain-text rendition is derived.
    let body_html = data["body"].as_str().unwrap_or("").to_string();
    let mut body_text = html_to_text(&body_html);
    let body_html = if body_html.is_empty() { None } else { Some(body_html) };
    if body_text.is_none() {
        body_text = data["preview"].as_str().map(str::to_string);
    }

    let draft = data["draft"].as_bool().unwrap_or(false);
    let deleted =
        data["deleted"].as_bool().unwrap_or(false) || data["trashed"].as_bool().unwrap_or(false);
    let deleted_at = deleted
        .then(|| data["trashed_at"].as_str().and_then(parse_datetime_str))
        .flatten();

    let mut source_links = std::collections::BTreeMap::new();
    if let Some(web_url) = data["web_url"].as_str() {
        source_links.insert("mailbox_url".to_string(), web_url.to_string());
    }

    EmailRecord {
        email_id: message_id,
        thread_id: Some(conversation_id.to_string()),
        subject: data["subject"].as_str().map(str::to_string),
        from_address,
        from_name,
        to_addresses,
        to_names,
        cc_addresses,
        cc_names,
        bcc_addresses,
        bcc_names,
        in_reply_to,
        body_text,
        body_html,
        sent_at,
        received_at,
        labels: labels.to_vec(),
        draft,
        deleted,
        deleted_at,
        source_links,
        attachments: parse_attachments(&data["attachments"]),
        raw: data.clone(),
    }
}

/// Delivery timestamps are unix integers of ambiguous unit, but sometimes
/// ISO strings.
fn parse_message_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(from_unix_magnitude),
        Value::String(s) => parse_datetime_str(s),
        _ => None,
    }
}

fn parse_single_address(value: &Value) -> (Option<String>, Option<String>) {
    match value {
        Value::Object(_) => {
            let address = value["address"]
                .as_str()
                .or_else(|| value["email"].as_str())
                .map(str::to_string);
            let name = value["name"].as_str().map(str::to_string);
            (address, name)
        }
        Value::String(s) if !s.is_empty() => (Some(s.clone()), None),
        _ => (None, None),
    }
}

/// Parse a recipient list into parallel address/name sequences; names are
/// empty strings where the upstream had none, keeping the sequences
/// index-aligned.
fn parse_address_fields(value: &Value) -> (Vec<String>, Vec<String>) {
    let mut addresses = Vec::new();
    let mut names = Vec::new();

    match value {
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(_) => {
                        let address =
                            item["address"].as_str().or_else(|| item["email"].as_str());
                        if let Some(address) = address {
                            addresses.push(address.to_string());
                            names.push(item["name"].as_str().unwrap_or("").to_string());
                        }
                    }
                    Value::String(s) if !s.is_empty() => {
                        addresses.push(s.clone());
                        names.push(String::new());
                    }
                    _ => {}
                }
            }
        }
        Value::String(s) if !s.is_empty() => {
            addresses.push(s.clone());
            names.push(String::new());
        }
        _ => {}
    }

    (addresses, names)
}

fn parse_attachments(value: &Value) -> Vec<Attachment> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .map(|item| Attachment {
            filename: item["filename"]
                .as_str()
                .or_else(|| item["name"].as_str())
                .unwrap_or("unknown")
                .to_string(),
            content_type: item["content_type"]
                .as_str()
                .or_else(|| item["type"].as_str())
                .unwrap_or("application/octet-stream")
                .to_string(),
            byte_size: item["size"].as_i64().unwrap_or(0),
            source_url: item["download_url"]
                .as_str()
                .or_else(|| item["url"].as_str())
                .unwrap_or("")
                .to_string(),
            checksum: item["checksum"].as_str().map(str::to_string),
        })
        .collect()
}
