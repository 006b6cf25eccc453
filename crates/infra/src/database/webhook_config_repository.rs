//! Persisted webhook registrations.
//!
//! Re-registration needs to know which hooks this service created last
//! time so stale ones get deleted instead of accumulating at the provider.

use std::sync::Arc;

use async_trait::async_trait;
use inflow_core::{WebhookConfigEntry, WebhookConfigStore};
use inflow_domain::{Result, Source};

use super::session::DbSession;

/// Webhook config repository over the `webhook_config` table.
pub struct PgWebhookConfigRepository {
    session: Arc<DbSession>,
}

impl PgWebhookConfigRepository {
    pub fn new(session: Arc<DbSession>) -> Self {
        Self { session }
    }
}

const GET_SQL: &str = "SELECT config, webhook_url FROM webhook_config WHERE source = $1";

const SAVE_SQL: &str = "INSERT INTO webhook_config (source, config, webhook_url, updated_at)
    VALUES ($1, $2, $3, NOW())
    ON CONFLICT (source) DO UPDATE SET
        config = EXCLUDED.config,
        webhook_url = EXCLUDED.webhook_url,
        updated_at = NOW()";

#[async_trait]
impl WebhookConfigStore for PgWebhookConfigRepository {
    async fn get(&self, source: Source) -> Result<Option<WebhookConfigEntry>> {
        let row = self
            .session
            .execute(|client| {
                let source = source.as_str();
                async move { client.query_opt(GET_SQL, &[&source]).await }
            })
            .await?;

        Ok(row.map(|row| WebhookConfigEntry {
            source,
            config: row.get("config"),
            webhook_url: row.get("webhook_url"),
        }))
    }

    async fn save(&self, entry: &WebhookConfigEntry) -> Result<()> {
        self.session
            .execute(|client| {
                let source = entry.source.as_str();
                let config = entry.config.clone();
                let webhook_url = entry.webhook_url.clone();
                async move {
                    client.execute(SAVE_SQL, &[&source, &config, &webhook_url]).await.map(|_| ())
                }
            })
            .await
    }
}
