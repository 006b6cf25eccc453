//! PostgreSQL-backed document store.

use std::sync::Arc;

use async_trait::async_trait;
use inflow_core::DocumentStore;
use inflow_domain::{DocumentRecord, Result};

use super::session::DbSession;

/// Document repository over the `documents` table.
pub struct PgDocumentRepository {
    session: Arc<DbSession>,
}

impl PgDocumentRepository {
    pub fn new(session: Arc<DbSession>) -> Self {
        Self { session }
    }
}

const UPSERT_SQL: &str = "INSERT INTO documents (
        id, title, markdown_content, is_deleted, folder_path, folder_id,
        location, daily_note_date, last_modified_at, created_at, raw_data
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    ON CONFLICT (id) DO UPDATE SET
        title = EXCLUDED.title,
        markdown_content = EXCLUDED.markdown_content,
        is_deleted = EXCLUDED.is_deleted,
        folder_path = EXCLUDED.folder_path,
        folder_id = EXCLUDED.folder_id,
        location = EXCLUDED.location,
        daily_note_date = EXCLUDED.daily_note_date,
        last_modified_at = EXCLUDED.last_modified_at,
        created_at = EXCLUDED.created_at,
        raw_data = EXCLUDED.raw_data,
        db_updated_at = NOW()";

const MARK_DELETED_SQL: &str = "UPDATE documents
    SET is_deleted = TRUE, db_updated_at = NOW()
    WHERE id = $1";

#[async_trait]
impl DocumentStore for PgDocumentRepository {
    async fn upsert(&self, document: &DocumentRecord) -> Result<()> {
        self.session
            .execute(|client| async move {
                client
                    .execute(
                        UPSERT_SQL,
                        &[
                            &document.id,
                            &document.title,
                            &document.markdown_content,
                            &document.is_deleted,
                            &document.folder_path,
                            &document.folder_id,
                            &document.location,
                            &document.daily_note_date,
                            &document.last_modified_at,
                            &document.created_at,
                            &document.raw,
                        ],
                    )
                    .await
                    .map(|_| ())
            })
            .await
    }

    async fn mark_deleted(&self, document_id: &str) -> Result<()> {
        self.session
            .execute(|client| {
                let document_id = document_id.to_string();
                async move { client.execute(MARK_DELETED_SQL, &[&document_id]).await.map(|_| ()) }
            })
            .await
    }
}
