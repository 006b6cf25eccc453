//! Background services: dispatcher, reconciler, doc poller, cleanup.

pub mod cleanup;
pub mod dispatcher;
pub mod doc_poller;
pub mod reconciler;

pub use cleanup::{CleanupService, CleanupServiceConfig};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use doc_poller::{DocPoller, DocPollerConfig};
pub use reconciler::{Reconciler, ReconcilerConfig};
