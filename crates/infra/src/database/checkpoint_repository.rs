//! PostgreSQL-backed checkpoint store.

use std::sync::Arc;

use async_trait::async_trait;
use inflow_core::CheckpointStore;
use inflow_domain::{Checkpoint, Result, Source};

use super::session::DbSession;

/// Checkpoint repository over the `checkpoints` table.
pub struct PgCheckpointRepository {
    session: Arc<DbSession>,
}

impl PgCheckpointRepository {
    pub fn new(session: Arc<DbSession>) -> Self {
        Self { session }
    }
}

const GET_SQL: &str =
    "SELECT last_event_time, last_cursor FROM checkpoints WHERE source = $1";

const SET_SQL: &str = "INSERT INTO checkpoints (source, last_event_time, last_cursor, updated_at)
    VALUES ($1, $2, $3, NOW())
    ON CONFLICT (source) DO UPDATE SET
        last_event_time = EXCLUDED.last_event_time,
        last_cursor = EXCLUDED.last_cursor,
        updated_at = NOW()";

#[async_trait]
impl CheckpointStore for PgCheckpointRepository {
    async fn get_checkpoint(&self, source: Source) -> Result<Option<Checkpoint>> {
        let row = self
            .session
            .execute(|client| {
                let source = source.as_str();
                async move { client.query_opt(GET_SQL, &[&source]).await }
            })
            .await?;

        Ok(row.map(|row| Checkpoint {
            source,
            last_event_time: row.get("last_event_time"),
            last_cursor: row.get("last_cursor"),
        }))
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.session
            .execute(|client| {
                let source = checkpoint.source.as_str();
                let last_event_time = checkpoint.last_event_time;
                let last_cursor = checkpoint.last_cursor.clone();
                async move {
                    client
                        .execute(SET_SQL, &[&source, &last_event_time, &last_cursor])
                        .await
                        .map(|_| ())
                }
            })
            .await
    }
}
