//! Domain data types

pub mod checkpoint;
pub mod config;
pub mod queue;
pub mod records;

pub use checkpoint::Checkpoint;
pub use config::{
    AppConfig, BackfillConfig, DatabaseConfig, DocsConfig, HttpConfig, QueueConfig, SourceConfig,
};
pub use queue::{NewQueueItem, QueueHealth, QueueItem, QueueStatus, Source, SourceQueueStats};
pub use records::{Attachment, DocumentRecord, EmailRecord, TaskRecord};
