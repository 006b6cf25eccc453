//! Per-source webhook body parsing.
//!
//! Each upstream sends a different body shape: the tracker posts
//! form-encoded fields, the mailbox and docs sources post JSON with their
//! own id field names. The receiver routes the raw body to the parser
//! registered for the source; parsers extract exactly one
//! `(event_type, external_id)` pair or reject with `InvalidInput` (HTTP 400).

use std::collections::BTreeMap;
use std::sync::Arc;

use inflow_domain::{InflowError, Result, Source};
use serde_json::Value;

/// The minimal event reference a webhook contributes to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub event_type: String,
    pub external_id: String,
}

/// Source-specific webhook body parser.
pub trait WebhookParser: Send + Sync {
    fn source(&self) -> Source;

    /// Extract the event reference from the raw body.
    fn parse(&self, body: &[u8]) -> Result<WebhookEvent>;
}

/// Tracker webhooks arrive form-encoded. The task id field differs between
/// webhook kinds: `Task.ID` for task events, bare `ID` for some others.
/// Form webhooks carry no usable event name.
pub struct TrackerWebhookParser;

impl WebhookParser for TrackerWebhookParser {
    fn source(&self) -> Source {
        Source::Tracker
    }

    fn parse(&self, body: &[u8]) -> Result<WebhookEvent> {
        let fields: BTreeMap<String, String> = url::form_urlencoded::parse(body)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        if fields.is_empty() {
            return Err(InflowError::InvalidInput("no form data received".into()));
        }

        let task_id = fields
            .get("Task.ID")
            .or_else(|| fields.get("ID"))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| InflowError::InvalidInput("no task id found in webhook".into()))?;

        Ok(WebhookEvent { event_type: "task.updated".into(), external_id: task_id.clone() })
    }
}

/// Mailbox webhooks are JSON; the conversation id hides in one of several
/// places depending on the event kind.
pub struct MailboxWebhookParser;

impl WebhookParser for MailboxWebhookParser {
    fn source(&self) -> Source {
        Source::Mailbox
    }

    fn parse(&self, body: &[u8]) -> Result<WebhookEvent> {
        let data: Value = serde_json::from_slice(body)
            .map_err(|_| InflowError::InvalidInput("no JSON payload".into()))?;

        let event_type = json_event_type(&data);

        let external_id = extract_conversation_id(&data)
            .ok_or_else(|| InflowError::InvalidInput("no conversation id found in webhook".into()))?;

        Ok(WebhookEvent { event_type, external_id })
    }
}

/// Docs webhooks are JSON with a top-level document id.
pub struct DocsWebhookParser;

impl WebhookParser for DocsWebhookParser {
    fn source(&self) -> Source {
        Source::Docs
    }

    fn parse(&self, body: &[u8]) -> Result<WebhookEvent> {
        let data: Value = serde_json::from_slice(body)
            .map_err(|_| InflowError::InvalidInput("no JSON payload".into()))?;

        let external_id = json_string(&data["id"])
            .ok_or_else(|| InflowError::InvalidInput("no document id found in webhook".into()))?;

        Ok(WebhookEvent { event_type: json_event_type(&data), external_id })
    }
}

/// `event` or `type`, defaulting to `"unknown"`.
fn json_event_type(data: &Value) -> String {
    data["event"]
        .as_str()
        .or_else(|| data["type"].as_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Conversation id priority: `conversation.id`, `conversation_id`,
/// `conversationId`, then `message.conversation_id`/`conversationId`.
fn extract_conversation_id(data: &Value) -> Option<String> {
    if let Some(id) = json_string(&data["conversation"]["id"]) {
        return Some(id);
    }
    for key in ["conversation_id", "conversationId"] {
        if let Some(id) = json_string(&data[key]) {
            return Some(id);
        }
    }
    if let Some(message) = data.get("message") {
        for key in ["conversation_id", "conversationId"] {
            if let Some(id) = json_string(&message[key]) {
                return Some(id);
            }
        }
    }
    None
}

/// Ids arrive as strings or numbers; normalise to a non-empty string.
fn json_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The full parser set keyed by source.
pub fn default_parsers() -> BTreeMap<Source, Arc<dyn WebhookParser>> {
    let parsers: [Arc<dyn WebhookParser>; 3] = [
        Arc::new(TrackerWebhookParser),
        Arc::new(MailboxWebhookParser),
        Arc::new(DocsWebhookParser),
    ];
    parsers.into_iter().map(|parser| (parser.source(), parser)).collect()
}
