//! # Inflow Core
//!
//! Pure pipeline logic layer - no infrastructure dependencies.
//!
//! This crate contains:
//! - Port/adapter interfaces (traits) for the queue, checkpoints and stores
//! - The normalizer contract and registry
//! - Record-store composition used by the dispatcher
//!
//! ## Architecture Principles
//! - Only depends on `inflow-domain`
//! - No database, HTTP, or platform code
//! - All external dependencies via traits

pub mod normalize;
pub mod queue;
pub mod store;
pub mod sync;

// Re-export specific items to avoid ambiguity
pub use normalize::{DomainRecord, NormalizeResult, Normalizer, NormalizerRegistry};
pub use queue::ports::WorkQueue;
pub use store::ports::{
    DocumentStore, EmailStore, TaskStore, WebhookConfigEntry, WebhookConfigStore,
};
pub use store::records::RecordStores;
pub use sync::ports::{BackfillSource, CheckpointStore, DatabaseProbe, RemoteSummary};
