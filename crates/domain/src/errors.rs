//! Error types used throughout the application

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for inflow
#[derive(Error, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum InflowError {
    #[error("Database error: {0}")]
    Database(String),

    /// The database could not be reached at all. Kept separate from
    /// [`InflowError::Database`] because the dispatcher must not ack queue
    /// items on connection loss (the visibility timeout recovers them),
    /// while logic errors go through the queue retry budget.
    #[error("Database unavailable: {0}")]
    DatabaseUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl InflowError {
    /// True when the error indicates the backing store is unreachable
    /// rather than an operation-level failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::DatabaseUnavailable(_))
    }
}

/// Result type alias for inflow operations
pub type Result<T> = std::result::Result<T, InflowError>;
