//! PostgreSQL-backed task store.
//!
//! Upserts are keyed on the remote task id and overwrite every mutable
//! column, so replaying the same remote state is a no-op and out-of-order
//! deliveries converge on the latest fetch. Link tables are replaced
//! delete-then-insert, which keeps the relational fan-out idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use inflow_core::TaskStore;
use inflow_domain::{Result, TaskRecord};
use serde_json::Value;

use super::session::DbSession;

/// Task repository over `tasks`, `task_tags` and `task_assignees`.
pub struct PgTaskRepository {
    session: Arc<DbSession>,
}

impl PgTaskRepository {
    pub fn new(session: Arc<DbSession>) -> Self {
        Self { session }
    }
}

const UPSERT_SQL: &str = "INSERT INTO tasks (
        task_id, project_id, project_name, tasklist_id, tasklist_name, title, description,
        status, priority, progress, tags, assignees, created_by, updated_by, due_at,
        updated_at, deleted, deleted_at, source_links, raw_data
    ) VALUES (
        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
    )
    ON CONFLICT (task_id) DO UPDATE SET
        project_id = EXCLUDED.project_id,
        project_name = EXCLUDED.project_name,
        tasklist_id = EXCLUDED.tasklist_id,
        tasklist_name = EXCLUDED.tasklist_name,
        title = EXCLUDED.title,
        description = EXCLUDED.description,
        status = EXCLUDED.status,
        priority = EXCLUDED.priority,
        progress = EXCLUDED.progress,
        tags = EXCLUDED.tags,
        assignees = EXCLUDED.assignees,
        created_by = EXCLUDED.created_by,
        updated_by = EXCLUDED.updated_by,
        due_at = EXCLUDED.due_at,
        updated_at = EXCLUDED.updated_at,
        deleted = EXCLUDED.deleted,
        deleted_at = EXCLUDED.deleted_at,
        source_links = EXCLUDED.source_links,
        raw_data = EXCLUDED.raw_data,
        db_updated_at = NOW()";

const MARK_DELETED_SQL: &str = "UPDATE tasks
    SET deleted = TRUE, deleted_at = NOW(), db_updated_at = NOW()
    WHERE task_id = $1";

const UNLINK_TAGS_SQL: &str = "DELETE FROM task_tags WHERE task_id = $1";
const LINK_TAGS_SQL: &str =
    "INSERT INTO task_tags (task_id, tag_id) SELECT $1, unnest($2::bigint[])";

const UNLINK_ASSIGNEES_SQL: &str = "DELETE FROM task_assignees WHERE task_id = $1";
const LINK_ASSIGNEES_SQL: &str =
    "INSERT INTO task_assignees (task_id, user_id) SELECT $1, unnest($2::bigint[])";

async fn upsert_with(
    client: &tokio_postgres::Client,
    statement: &tokio_postgres::Statement,
    task: &TaskRecord,
    source_links: &Value,
) -> std::result::Result<u64, tokio_postgres::Error> {
    client
        .execute(
            statement,
            &[
                &task.task_id,
                &task.project_id,
                &task.project_name,
                &task.tasklist_id,
                &task.tasklist_name,
                &task.title,
                &task.description,
                &task.status,
                &task.priority,
                &task.progress,
                &task.tags,
                &task.assignees,
                &task.created_by,
                &task.updated_by,
                &task.due_at,
                &task.updated_at,
                &task.deleted,
                &task.deleted_at,
                source_links,
                &task.raw,
            ],
        )
        .await
}

fn links_json(task: &TaskRecord) -> Value {
    serde_json::to_value(&task.source_links).unwrap_or(Value::Null)
}

#[async_trait]
impl TaskStore for PgTaskRepository {
    async fn upsert_batch(&self, tasks: &[TaskRecord]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let links: Vec<Value> = tasks.iter().map(links_json).collect();

        // One prepared statement, all rows pipelined on the shared
        // connection: the batch costs one round trip of latency, not N.
        self.session
            .execute(|client| {
                let links = links.clone();
                async move {
                    let statement = client.prepare(UPSERT_SQL).await?;
                    try_join_all(
                        tasks
                            .iter()
                            .zip(links.iter())
                            .map(|(task, link)| upsert_with(&client, &statement, task, link)),
                    )
                    .await
                    .map(|_| ())
                }
            })
            .await
    }

    async fn upsert(&self, task: &TaskRecord) -> Result<()> {
        let links = links_json(task);
        self.session
            .execute(|client| {
                let links = links.clone();
                async move {
                    let statement = client.prepare(UPSERT_SQL).await?;
                    upsert_with(&client, &statement, task, &links).await.map(|_| ())
                }
            })
            .await
    }

    async fn mark_deleted(&self, task_id: &str) -> Result<()> {
        self.session
            .execute(|client| {
                let task_id = task_id.to_string();
                async move { client.execute(MARK_DELETED_SQL, &[&task_id]).await.map(|_| ()) }
            })
            .await
    }

    async fn link_tags(&self, task_id: &str, tag_ids: &[i64]) -> Result<()> {
        let ids = tag_ids.to_vec();
        self.session
            .execute(|client| {
                let task_id = task_id.to_string();
                let ids = ids.clone();
                async move {
                    client.execute(UNLINK_TAGS_SQL, &[&task_id]).await?;
                    client.execute(LINK_TAGS_SQL, &[&task_id, &ids]).await.map(|_| ())
                }
            })
            .await
    }

    async fn link_assignees(&self, task_id: &str, user_ids: &[i64]) -> Result<()> {
        let ids = user_ids.to_vec();
        self.session
            .execute(|client| {
                let task_id = task_id.to_string();
                let ids = ids.clone();
                async move {
                    client.execute(UNLINK_ASSIGNEES_SQL, &[&task_id]).await?;
                    client.execute(LINK_ASSIGNEES_SQL, &[&task_id, &ids]).await.map(|_| ())
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_overwrites_every_mutable_column() {
        for column in
            ["title", "status", "tags", "assignees", "deleted", "raw_data", "source_links"]
        {
            assert!(
                UPSERT_SQL.contains(&format!("{column} = EXCLUDED.{column}")),
                "column {column} must be overwritten on conflict"
            );
        }
    }

    #[test]
    fn links_serialize_to_a_json_object() {
        let mut task = TaskRecord { task_id: "42".into(), ..Default::default() };
        task.source_links.insert("tracker_url".into(), "https://x/#/tasks/42".into());
        let value = links_json(&task);
        assert_eq!(value["tracker_url"], "https://x/#/tasks/42");
    }
}
