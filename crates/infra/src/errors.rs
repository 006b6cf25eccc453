//! Infrastructure error types and connection-error classification.
//!
//! The dispatcher's ack policy hinges on one distinction: did an operation
//! fail because the database is unreachable (do not ack, let the visibility
//! timeout recover the item) or because of the operation itself (ack as
//! failed and let the retry budget decide). Classification prefers the
//! driver's typed signals and falls back to a substring denylist only for
//! errors the driver reports as opaque strings.

use inflow_domain::InflowError;
use thiserror::Error;

/// Errors raised inside the infrastructure layer.
#[derive(Error, Debug)]
pub enum InfraError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("tls setup error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("connect timeout after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("{0}")]
    Config(String),
}

/// Message fragments that indicate a lost connection when no typed signal
/// is available. Last-resort fallback; the typed checks run first.
const CONNECTION_DENYLIST: &[&str] = &[
    "connection",
    "server closed",
    "network",
    "timeout",
    "could not connect",
    "terminating connection",
    "connection refused",
    "no route to host",
    "connection reset",
    "broken pipe",
    "unexpected eof",
];

/// True when the message looks like a connection-level failure.
pub(crate) fn message_indicates_connection_loss(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    CONNECTION_DENYLIST.iter().any(|needle| lowered.contains(needle))
}

/// Classify a driver error as connection-level or operation-level.
pub fn is_connection_error(err: &tokio_postgres::Error) -> bool {
    if err.is_closed() {
        return true;
    }

    // SQLSTATE class 08 is "connection exception"; 57P01..57P03 cover
    // admin shutdown, crash shutdown and cannot-connect-now.
    if let Some(db_err) = err.as_db_error() {
        let code = db_err.code().code();
        if code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03") {
            return true;
        }
        return false;
    }

    // Transport-level failures surface as wrapped io errors.
    if std::error::Error::source(err).is_some_and(|source| source.is::<std::io::Error>()) {
        return true;
    }

    message_indicates_connection_loss(&err.to_string())
}

/// Map a driver error into the domain error space, preserving the
/// connection/operation distinction.
pub fn map_postgres_error(err: tokio_postgres::Error) -> InflowError {
    if is_connection_error(&err) {
        InflowError::DatabaseUnavailable(err.to_string())
    } else {
        InflowError::Database(err.to_string())
    }
}

impl From<InfraError> for InflowError {
    fn from(err: InfraError) -> Self {
        match err {
            InfraError::Postgres(pg) => map_postgres_error(pg),
            InfraError::Tls(tls) => InflowError::Internal(format!("tls setup failed: {tls}")),
            InfraError::Http(http) => InflowError::Network(http.to_string()),
            InfraError::ConnectTimeout(timeout) => {
                InflowError::DatabaseUnavailable(format!("connect timeout after {timeout:?}"))
            }
            InfraError::Config(message) => InflowError::Config(message),
        }
    }
}
