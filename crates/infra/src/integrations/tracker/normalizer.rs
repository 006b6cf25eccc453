//! Tracker event normalization.
//!
//! Rebuilds the authoritative task state from the API response: names for
//! tags and assignees are resolved from the included side-resource maps,
//! and the numeric ids needed for the relational link tables ride along on
//! side-channel fields.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inflow_core::{DomainRecord, NormalizeResult, Normalizer};
use inflow_domain::{Result, Source, TaskRecord};
use serde_json::Value;
use tracing::{debug, info};

use super::client::{TrackerClient, TrackerTaskResponse};
use crate::integrations::{parse_datetime, value_to_string};

/// Normalizer for the task tracker.
pub struct TrackerNormalizer {
    client: Arc<TrackerClient>,
    /// Tasks created before this instant are ignored entirely.
    process_after: Option<DateTime<Utc>>,
}

impl TrackerNormalizer {
    pub fn new(client: Arc<TrackerClient>, process_after: Option<DateTime<Utc>>) -> Self {
        Self { client, process_after }
    }

    fn filtered_by_date(&self, task: &Value) -> bool {
        let Some(threshold) = self.process_after else {
            return false;
        };
        match parse_datetime(&task["createdAt"]) {
            Some(created_at) => created_at < threshold,
            None => false,
        }
    }

    fn parse_task(&self, response: &TrackerTaskResponse) -> TaskRecord {
        let task = &response.task;
        let included = &response.included;

        let task_id = value_to_string(&task["id"]).unwrap_or_default();

        // Tasklist and project names come from the included maps, keyed by
        // stringified id.
        let tasklist_id = value_to_string(&task["tasklist"]["id"]);
        let mut tasklist_name = None;
        let mut project_id = None;
        if let Some(ref tid) = tasklist_id {
            let tasklist = &included["tasklists"][tid.as_str()];
            tasklist_name = tasklist["name"].as_str().map(str::to_string);
            project_id = value_to_string(&tasklist["project"]["id"]);
        }
        let project_name = project_id
            .as_ref()
            .and_then(|pid| included["projects"][pid.as_str()]["name"].as_str())
            .map(str::to_string);

        let tags = resolve_tags(&task["tags"], &included["tags"]);
        let assignees = resolve_assignees(
            &task["assignees"],
            &included["users"],
            &included["companies"],
            &included["teams"],
        );
        let created_by = resolve_user_name(&task["createdBy"], &included["users"]);
        let updated_by = resolve_user_name(&task["updatedBy"], &included["users"]);

        let completed = task["completed"].as_bool().unwrap_or(false);
        let deleted = task["deleted"].as_bool().unwrap_or(false)
            || completed
            || !task["deletedAt"].is_null();
        let deleted_at = deleted.then(|| parse_datetime(&task["completedAt"])).flatten();

        let mut source_links = std::collections::BTreeMap::new();
        let web_url = task["url"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| self.client.build_task_web_url(&task_id));
        source_links.insert("tracker_url".to_string(), web_url);

        TaskRecord {
            task_id,
            project_id,
            project_name,
            tasklist_id,
            tasklist_name,
            title: task["name"].as_str().or_else(|| task["title"].as_str()).map(str::to_string),
            description: task["description"].as_str().map(str::to_string),
            status: task["status"].as_str().or_else(|| task["state"].as_str()).map(str::to_string),
            priority: task["priority"].as_str().map(str::to_string),
            progress: task["progress"].as_i64().and_then(|p| i32::try_from(p).ok()),
            tags,
            assignees,
            created_by,
            updated_by,
            due_at: parse_datetime(&task["dueDate"]),
            updated_at: parse_datetime(&task["updatedAt"]).or_else(|| Some(Utc::now())),
            deleted,
            deleted_at,
            source_links,
            tag_ids_to_link: collect_ids(&task["tags"], None),
            assignee_user_ids_to_link: collect_ids(&task["assignees"], Some("users")),
            raw: task.clone(),
        }
    }
}

#[async_trait]
impl Normalizer for TrackerNormalizer {
    fn source(&self) -> Source {
        Source::Tracker
    }

    async fn process(&self, event_type: &str, external_id: &str) -> Result<NormalizeResult> {
        debug!(event_type, external_id, "processing tracker event");

        if event_type.to_ascii_lowercase().contains("deleted") {
            return Ok(NormalizeResult::Deleted(vec![external_id.to_string()]));
        }

        let Some(response) = self.client.get_task(external_id).await? else {
            info!(external_id, "task gone remotely, marking deleted");
            return Ok(NormalizeResult::Deleted(vec![external_id.to_string()]));
        };

        if self.filtered_by_date(&response.task) {
            debug!(external_id, "task created before process-after threshold, skipping");
            return Ok(NormalizeResult::Skip);
        }

        let record = self.parse_task(&response);
        Ok(NormalizeResult::Records(vec![DomainRecord::Task(record)]))
    }
}

/// Resolve tag references to names via the included tag map, falling back
/// to the name embedded in the reference, then the bare id.
fn resolve_tags(tag_refs: &Value, tags_included: &Value) -> Vec<String> {
    let Some(refs) = tag_refs.as_array() else {
        return Vec::new();
    };

    refs.iter()
        .filter_map(|tag_ref| {
            let tag_id = value_to_string(&tag_ref["id"]).or_else(|| value_to_string(tag_ref))?;
            if let Some(name) = tags_included[tag_id.as_str()]["name"].as_str() {
                return Some(name.to_string());
            }
            if let Some(name) = tag_ref["name"].as_str() {
                return Some(name.to_string());
            }
            Some(tag_id)
        })
        .collect()
}

/// Resolve assignee references to display names. An assignee may be a
/// user, a company or a team; the reference's `type` says which map to
/// consult, with a cross-map fallback for untyped references.
fn resolve_assignees(
    assignee_refs: &Value,
    users: &Value,
    companies: &Value,
    teams: &Value,
) -> Vec<String> {
    let Some(refs) = assignee_refs.as_array() else {
        return Vec::new();
    };

    refs.iter()
        .filter_map(|assignee| {
            let id = value_to_string(&assignee["id"])?;
            let kind = assignee["type"].as_str().unwrap_or("");

            match kind {
                "users" if !users[id.as_str()].is_null() => {
                    Some(user_display_name(&users[id.as_str()], &id))
                }
                "companies" if !companies[id.as_str()].is_null() => {
                    Some(named_or_id(&companies[id.as_str()], &id))
                }
                "teams" if !teams[id.as_str()].is_null() => {
                    Some(named_or_id(&teams[id.as_str()], &id))
                }
                _ => {
                    if !users[id.as_str()].is_null() {
                        Some(user_display_name(&users[id.as_str()], &id))
                    } else if !companies[id.as_str()].is_null() {
                        Some(named_or_id(&companies[id.as_str()], &id))
                    } else if !teams[id.as_str()].is_null() {
                        Some(named_or_id(&teams[id.as_str()], &id))
                    } else {
                        Some(id)
                    }
                }
            }
        })
        .collect()
}

fn resolve_user_name(user_ref: &Value, users: &Value) -> Option<String> {
    let id = value_to_string(&user_ref["id"]).or_else(|| value_to_string(user_ref))?;
    let user = &users[id.as_str()];
    if user.is_null() {
        return Some(id);
    }
    Some(user_display_name(user, &id))
}

fn user_display_name(user: &Value, fallback_id: &str) -> String {
    let first = user["firstName"].as_str().unwrap_or("");
    let last = user["lastName"].as_str().unwrap_or("");
    let full = format!("{first} {last}").trim().to_string();
    if !full.is_empty() {
        return full;
    }
    user["email"].as_str().unwrap_or(fallback_id).to_string()
}

fn named_or_id(entity: &Value, fallback_id: &str) -> String {
    entity["name"].as_str().unwrap_or(fallback_id).to_string()
}

/// Collect numeric ids from a reference list for the link tables. With
/// `required_type`, only references of that type count (assignees mix
/// users, companies and teams, but only users are linked).
fn collect_ids(refs: &Value, required_type: Option<&str>) -> Vec<i64> {
    let Some(refs) = refs.as_array() else {
        return Vec::new();
    };

    refs.iter()
        .filter_map(|item| {
            if let Some(required) = required_type {
                if item["type"].as_str() != Some(required) {
                    return None;
                }
            }
            match &item["id"] {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse().ok(),
                _ => value_to_string(item).and_then(|s| s.parse().ok()),
            }
        })
        .collect()
}
