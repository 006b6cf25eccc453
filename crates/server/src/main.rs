//! inflowd — bidirectional ingest-and-sync daemon.
//!
//! Wires the resilient database session, the durable queue, the webhook
//! receiver and the background services together, then serves until a
//! shutdown signal arrives. Exit codes: 0 on normal shutdown, 1 on a
//! configuration error, 2 on an unrecoverable initialization error.

mod telemetry;

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;

use inflow_core::{
    BackfillSource, CheckpointStore, DatabaseProbe, NormalizerRegistry, RecordStores,
    WebhookConfigStore, WorkQueue,
};
use inflow_domain::{AppConfig, Result, Source};
use inflow_infra::config as app_config;
use inflow_infra::database::{
    DbSession, PgCheckpointRepository, PgDocumentRepository, PgEmailRepository, PgQueueRepository,
    PgTaskRepository, PgWebhookConfigRepository,
};
use inflow_infra::http::{default_parsers, WebhookServer, WebhookServerState};
use inflow_infra::integrations::docs::{DocsClient, DocsNormalizer};
use inflow_infra::integrations::mailbox::{MailboxBackfill, MailboxClient, MailboxNormalizer};
use inflow_infra::integrations::tracker::{TrackerBackfill, TrackerClient, TrackerNormalizer};
use inflow_infra::sync::{
    CleanupService, CleanupServiceConfig, Dispatcher, DispatcherConfig, DocPoller,
    DocPollerConfig, Reconciler, ReconcilerConfig,
};
use inflow_infra::webhooks::WebhookRegistrar;
use inflow_infra::Supervisor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn main() -> ExitCode {
    let config = match app_config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    telemetry::init(&config.log_level);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to build async runtime");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal error");
            ExitCode::from(2)
        }
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    info!(port = config.http.port, "inflowd starting");

    // Database session and repositories. The session connects lazily, so
    // startup succeeds even while the database is down.
    let session = Arc::new(DbSession::new(config.database.clone())?);
    let queue: Arc<dyn WorkQueue> =
        Arc::new(PgQueueRepository::new(Arc::clone(&session), config.queue.clone()));
    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(PgCheckpointRepository::new(Arc::clone(&session)));
    let webhook_config: Arc<dyn WebhookConfigStore> =
        Arc::new(PgWebhookConfigRepository::new(Arc::clone(&session)));
    let stores = Arc::new(RecordStores::new(
        Arc::new(PgTaskRepository::new(Arc::clone(&session))),
        Arc::new(PgEmailRepository::new(Arc::clone(&session))),
        Arc::new(PgDocumentRepository::new(Arc::clone(&session))),
    ));

    // Source clients and normalizers
    let tracker_client = Arc::new(TrackerClient::new(&config.tracker)?);
    let mailbox_client = Arc::new(MailboxClient::new(&config.mailbox)?);
    let docs_client = match &config.docs {
        Some(docs) => Some(Arc::new(DocsClient::new(docs)?)),
        None => None,
    };

    let mut registry = NormalizerRegistry::new()
        .register(Arc::new(TrackerNormalizer::new(
            Arc::clone(&tracker_client),
            config.tracker.process_after,
        )))
        .register(Arc::new(MailboxNormalizer::new(Arc::clone(&mailbox_client))));
    if let Some(client) = &docs_client {
        registry = registry.register(Arc::new(DocsNormalizer::new(Arc::clone(client))));
    }
    let normalizers = Arc::new(registry);

    let sources: Vec<Arc<dyn BackfillSource>> = vec![
        Arc::new(TrackerBackfill::new(Arc::clone(&tracker_client), config.tracker.process_after)),
        Arc::new(MailboxBackfill::new(Arc::clone(&mailbox_client), config.mailbox.process_after)),
    ];

    // Background services
    let cleanup = CleanupService::new(
        Arc::clone(&queue),
        CleanupServiceConfig {
            visibility_timeout_minutes: config.queue.visibility_timeout_minutes,
            retention_days: config.queue.retention_days,
            ..Default::default()
        },
    );
    let dispatcher =
        Dispatcher::new(Arc::clone(&queue), normalizers, stores, DispatcherConfig::default());
    let reconciler = Reconciler::new(
        sources,
        Arc::clone(&queue),
        checkpoints,
        ReconcilerConfig {
            interval: config.backfill.interval,
            overlap: config.backfill.overlap,
            ..Default::default()
        },
    );
    let doc_poller = docs_client.map(|client| {
        DocPoller::new(
            client,
            Arc::clone(&queue),
            DocPollerConfig {
                interval: config.backfill.doc_poll_interval,
                ..Default::default()
            },
        )
    });

    let mut supervisor =
        Supervisor::new(Arc::clone(&session), cleanup, dispatcher, reconciler, doc_poller);
    supervisor.start().await?;

    register_webhooks(&config, Arc::clone(&webhook_config))?;

    // Webhook receiver
    let mut secrets = BTreeMap::new();
    secrets.insert(Source::Tracker, config.tracker.webhook_secret.clone());
    secrets.insert(Source::Mailbox, config.mailbox.webhook_secret.clone());
    secrets.insert(Source::Docs, config.docs.as_ref().and_then(|d| d.webhook_secret.clone()));

    let probe: Arc<dyn DatabaseProbe> = Arc::clone(&session) as Arc<dyn DatabaseProbe>;
    let state = Arc::new(WebhookServerState {
        queue: Arc::clone(&queue),
        probe,
        parsers: default_parsers(),
        secrets,
        visibility_timeout_minutes: config.queue.visibility_timeout_minutes,
    });

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    WebhookServer::new(state)
        .serve(config.http.port, shutdown, config.http.shutdown_grace)
        .await?;

    supervisor.shutdown().await;
    info!("inflowd shutdown complete");
    Ok(())
}

/// Register webhook endpoints with the upstream systems, when a public URL
/// is configured and webhooks are enabled. Best effort: runs on its own
/// task and never blocks startup.
fn register_webhooks(config: &AppConfig, store: Arc<dyn WebhookConfigStore>) -> Result<()> {
    if config.backfill.disable_webhooks {
        info!("webhooks disabled, relying on periodic polling");
        return Ok(());
    }
    let Some(public_url) = config.public_url.clone() else {
        info!("no public URL configured, skipping webhook auto-registration");
        return Ok(());
    };

    let registrar = WebhookRegistrar::new(store)?;
    let tracker = config.tracker.clone();
    let mailbox = config.mailbox.clone();
    tokio::spawn(async move {
        registrar.register_tracker(&tracker, &public_url).await;
        registrar.register_mailbox(&mailbox, &public_url).await;
    });
    Ok(())
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
