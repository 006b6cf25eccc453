//! PostgreSQL-backed email store.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use inflow_core::EmailStore;
use inflow_domain::{EmailRecord, Result};
use serde_json::Value;

use super::session::DbSession;

/// Email repository over the `emails` table.
pub struct PgEmailRepository {
    session: Arc<DbSession>,
}

impl PgEmailRepository {
    pub fn new(session: Arc<DbSession>) -> Self {
        Self { session }
    }
}

const UPSERT_SQL: &str = "INSERT INTO emails (
        email_id, thread_id, subject, from_address, from_name,
        to_addresses, to_names, cc_addresses, cc_names, bcc_addresses, bcc_names,
        in_reply_to, body_text, body_html, sent_at, received_at, labels,
        draft, deleted, deleted_at, source_links, attachments, raw_data
    ) VALUES (
        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
        $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23
    )
    ON CONFLICT (email_id) DO UPDATE SET
        thread_id = EXCLUDED.thread_id,
        subject = EXCLUDED.subject,
        from_address = EXCLUDED.from_address,
        from_name = EXCLUDED.from_name,
        to_addresses = EXCLUDED.to_addresses,
        to_names = EXCLUDED.to_names,
        cc_addresses = EXCLUDED.cc_addresses,
        cc_names = EXCLUDED.cc_names,
        bcc_addresses = EXCLUDED.bcc_addresses,
        bcc_names = EXCLUDED.bcc_names,
        in_reply_to = EXCLUDED.in_reply_to,
        body_text = EXCLUDED.body_text,
        body_html = EXCLUDED.body_html,
        sent_at = EXCLUDED.sent_at,
        received_at = EXCLUDED.received_at,
        labels = EXCLUDED.labels,
        draft = EXCLUDED.draft,
        deleted = EXCLUDED.deleted,
        deleted_at = EXCLUDED.deleted_at,
        source_links = EXCLUDED.source_links,
        attachments = EXCLUDED.attachments,
        raw_data = EXCLUDED.raw_data,
        db_updated_at = NOW()";

const MARK_DELETED_SQL: &str = "UPDATE emails
    SET deleted = TRUE, deleted_at = NOW(), db_updated_at = NOW()
    WHERE email_id = $1";

async fn upsert_with(
    client: &tokio_postgres::Client,
    statement: &tokio_postgres::Statement,
    email: &EmailRecord,
    source_links: &Value,
    attachments: &Value,
) -> std::result::Result<u64, tokio_postgres::Error> {
    client
        .execute(
            statement,
            &[
                &email.email_id,
                &email.thread_id,
                &email.subject,
                &email.from_address,
                &email.from_name,
                &email.to_addresses,
                &email.to_names,
                &email.cc_addresses,
                &email.cc_names,
                &email.bcc_addresses,
                &email.bcc_names,
                &email.in_reply_to,
                &email.body_text,
                &email.body_html,
                &email.sent_at,
                &email.received_at,
                &email.labels,
                &email.draft,
                &email.deleted,
                &email.deleted_at,
                source_links,
                attachments,
                &email.raw,
            ],
        )
        .await
}

fn json_fields(email: &EmailRecord) -> (Value, Value) {
    let links = serde_json::to_value(&email.source_links).unwrap_or(Value::Null);
    let attachments = serde_json::to_value(&email.attachments).unwrap_or(Value::Null);
    (links, attachments)
}

#[async_trait]
impl EmailStore for PgEmailRepository {
    async fn upsert_batch(&self, emails: &[EmailRecord]) -> Result<()> {
        if emails.is_empty() {
            return Ok(());
        }
        let json: Vec<(Value, Value)> = emails.iter().map(json_fields).collect();

        self.session
            .execute(|client| {
                let json = json.clone();
                async move {
                    let statement = client.prepare(UPSERT_SQL).await?;
                    try_join_all(emails.iter().zip(json.iter()).map(
                        |(email, (links, attachments))| {
                            upsert_with(&client, &statement, email, links, attachments)
                        },
                    ))
                    .await
                    .map(|_| ())
                }
            })
            .await
    }

    async fn upsert(&self, email: &EmailRecord) -> Result<()> {
        let (links, attachments) = json_fields(email);
        self.session
            .execute(|client| {
                let links = links.clone();
                let attachments = attachments.clone();
                async move {
                    let statement = client.prepare(UPSERT_SQL).await?;
                    upsert_with(&client, &statement, email, &links, &attachments)
                        .await
                        .map(|_| ())
                }
            })
            .await
    }

    async fn mark_deleted(&self, email_id: &str) -> Result<()> {
        self.session
            .execute(|client| {
                let email_id = email_id.to_string();
                async move { client.execute(MARK_DELETED_SQL, &[&email_id]).await.map(|_| ()) }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inflow_domain::Attachment;

    #[test]
    fn attachments_serialize_with_metadata_only() {
        let email = EmailRecord {
            email_id: "m-1".into(),
            attachments: vec![Attachment {
                filename: "report.pdf".into(),
                content_type: "application/pdf".into(),
                byte_size: 1024,
                source_url: "https://mail.example.com/a/1".into(),
                checksum: None,
            }],
            ..Default::default()
        };
        let (_, attachments) = json_fields(&email);
        assert_eq!(attachments[0]["filename"], "report.pdf");
        assert_eq!(attachments[0]["byte_size"], 1024);
    }

    #[test]
    fn upsert_overwrites_body_and_labels() {
        for column in ["body_text", "body_html", "labels", "deleted", "attachments"] {
            assert!(UPSERT_SQL.contains(&format!("{column} = EXCLUDED.{column}")));
        }
    }
}
