//! PostgreSQL session and repositories.

pub mod checkpoint_repository;
pub mod document_repository;
pub mod email_repository;
pub mod queue_repository;
pub mod session;
pub mod task_repository;
pub mod webhook_config_repository;

pub use checkpoint_repository::PgCheckpointRepository;
pub use document_repository::PgDocumentRepository;
pub use email_repository::PgEmailRepository;
pub use queue_repository::PgQueueRepository;
pub use session::DbSession;
pub use task_repository::PgTaskRepository;
pub use webhook_config_repository::PgWebhookConfigRepository;
