//! Component lifecycle supervision.
//!
//! Startup order: database session probe (informational; a down database
//! never blocks startup), queue maintenance (whose immediate pass sweeps
//! items a crashed worker left leased), dispatcher, reconciler (startup
//! one-shot plus timer), and the doc poller when the docs source is
//! configured. Shutdown stops everything in reverse. The webhook receiver
//! itself is served by the binary; it shares the cancellation token used
//! here.

use std::sync::Arc;

use inflow_core::DatabaseProbe;
use inflow_domain::Result;
use tracing::{error, info, instrument, warn};

use crate::database::DbSession;
use crate::sync::{CleanupService, Dispatcher, DocPoller, Reconciler};

/// Owns and sequences the background services.
pub struct Supervisor {
    session: Arc<DbSession>,
    cleanup: CleanupService,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    doc_poller: Option<DocPoller>,
}

impl Supervisor {
    pub fn new(
        session: Arc<DbSession>,
        cleanup: CleanupService,
        dispatcher: Dispatcher,
        reconciler: Reconciler,
        doc_poller: Option<DocPoller>,
    ) -> Self {
        Self { session, cleanup, dispatcher, reconciler, doc_poller }
    }

    /// Start every background service. Never fails because the database is
    /// down; the services reconnect on their own and the receiver reports
    /// degraded health in the meantime.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<()> {
        if self.session.is_connected().await {
            info!("database reachable");
        } else {
            warn!("database unavailable at startup, running degraded until it returns");
        }

        self.cleanup.start()?;
        self.dispatcher.start()?;
        self.reconciler.start()?;
        if let Some(poller) = self.doc_poller.as_mut() {
            poller.start()?;
        }

        info!("background services started");
        Ok(())
    }

    /// Stop everything in reverse start order. Errors are logged, not
    /// propagated: shutdown always completes.
    #[instrument(skip(self))]
    pub async fn shutdown(&mut self) {
        info!("stopping background services");

        if let Some(poller) = self.doc_poller.as_mut() {
            if poller.is_running() {
                if let Err(err) = poller.stop().await {
                    error!(error = %err, "doc poller did not stop cleanly");
                }
            }
        }
        if self.reconciler.is_running() {
            if let Err(err) = self.reconciler.stop().await {
                error!(error = %err, "reconciler did not stop cleanly");
            }
        }
        if self.dispatcher.is_running() {
            if let Err(err) = self.dispatcher.stop().await {
                error!(error = %err, "dispatcher did not stop cleanly");
            }
        }
        if self.cleanup.is_running() {
            if let Err(err) = self.cleanup.stop().await {
                error!(error = %err, "cleanup service did not stop cleanly");
            }
        }

        info!("background services stopped");
    }
}
