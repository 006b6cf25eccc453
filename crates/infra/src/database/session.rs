//! Resilient PostgreSQL session.
//!
//! One process-wide object owns at most one live connection and is the
//! single mutation point for connection state. Callers never hold a raw
//! handle across calls; they pass operation closures to [`DbSession::execute`]
//! (retrying) or [`DbSession::execute_once`] (fail-fast, used on the webhook
//! enqueue path so senders get a quick 503 instead of a stalled request).
//!
//! Every queue and upsert operation is a single server-side-atomic
//! statement, so no transaction handle ever crosses an await point and
//! concurrent queries can share the pipelined connection.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use inflow_core::DatabaseProbe;
use inflow_domain::{DatabaseConfig, InflowError, Result};
use postgres_native_tls::MakeTlsConnector;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use crate::errors::{is_connection_error, map_postgres_error};

/// Minimum spacing between failed connect attempts on the fail-fast path,
/// so a burst of webhooks during an outage does not hammer the server.
const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Process-wide database session with automatic reconnection.
pub struct DbSession {
    config: DatabaseConfig,
    tls: MakeTlsConnector,
    slot: RwLock<Option<Arc<Client>>>,
    /// Serializes reconnection; normal queries run concurrently.
    reconnect_lock: Mutex<()>,
    /// Instant of the last failed connect attempt (fail-fast rate limit).
    last_failed_attempt: StdMutex<Option<Instant>>,
}

impl DbSession {
    /// Create a session. Does not connect; the first operation (or
    /// [`DbSession::ensure_connected`]) establishes the connection, so the
    /// process can start while the database is down.
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        let connector = native_tls::TlsConnector::new()
            .map_err(|err| InflowError::Internal(format!("tls setup failed: {err}")))?;

        Ok(Self {
            config,
            tls: MakeTlsConnector::new(connector),
            slot: RwLock::new(None),
            reconnect_lock: Mutex::new(()),
            last_failed_attempt: StdMutex::new(None),
        })
    }

    async fn current(&self) -> Option<Arc<Client>> {
        let slot = self.slot.read().await;
        slot.as_ref().filter(|client| !client.is_closed()).cloned()
    }

    /// Drop the slot if it still holds `stale`. A newer client installed by
    /// a concurrent reconnect is left alone.
    async fn invalidate(&self, stale: &Arc<Client>) {
        let mut slot = self.slot.write().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, stale)) {
            *slot = None;
        }
    }

    /// One connect attempt with the configured timeout. On success the new
    /// client is installed in the slot and the connection driver runs on its
    /// own task.
    async fn connect_once(&self) -> Result<Arc<Client>> {
        let connect = tokio_postgres::connect(&self.config.dsn, self.tls.clone());
        let (client, connection) = match timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => return Err(map_postgres_error(err)),
            Err(_) => {
                return Err(InflowError::DatabaseUnavailable(format!(
                    "connect timeout after {:?}",
                    self.config.connect_timeout
                )))
            }
        };

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(error = %err, "postgres connection task ended");
            }
        });

        let client = Arc::new(client);
        *self.slot.write().await = Some(Arc::clone(&client));
        info!("postgres connection established");
        Ok(client)
    }

    fn note_failed_attempt(&self) {
        if let Ok(mut last) = self.last_failed_attempt.lock() {
            *last = Some(Instant::now());
        }
    }

    fn clear_failed_attempt(&self) {
        if let Ok(mut last) = self.last_failed_attempt.lock() {
            *last = None;
        }
    }

    fn recently_failed(&self) -> bool {
        self.last_failed_attempt
            .lock()
            .ok()
            .and_then(|last| *last)
            .is_some_and(|at| at.elapsed() < MIN_RETRY_INTERVAL)
    }

    /// Current client, or one reconnect attempt.
    async fn acquire(&self) -> Result<Arc<Client>> {
        if let Some(client) = self.current().await {
            return Ok(client);
        }

        let _guard = self.reconnect_lock.lock().await;
        if let Some(client) = self.current().await {
            return Ok(client);
        }
        match self.connect_once().await {
            Ok(client) => {
                self.clear_failed_attempt();
                Ok(client)
            }
            Err(err) => {
                self.note_failed_attempt();
                Err(err)
            }
        }
    }

    /// Current client, or one *rate-limited* reconnect attempt. Refuses
    /// immediately when a connect attempt failed within the last few
    /// seconds, so request handlers never pile up on a down database.
    async fn try_acquire(&self) -> Result<Arc<Client>> {
        if let Some(client) = self.current().await {
            return Ok(client);
        }
        if self.recently_failed() {
            return Err(InflowError::DatabaseUnavailable(
                "database connection unavailable, retry later".into(),
            ));
        }
        self.acquire().await
    }

    /// Block until a live connection exists, reconnecting with exponential
    /// backoff indefinitely. Callers must not race it with their own
    /// reconnect logic.
    pub async fn ensure_connected(&self) -> Arc<Client> {
        let mut delay = self.config.reconnect_delay;
        loop {
            match self.acquire().await {
                Ok(client) => return client,
                Err(err) => {
                    warn!(error = %err, retry_in = ?delay, "failed to connect to postgres");
                    sleep(delay).await;
                    delay = (delay * 2).min(self.config.max_reconnect_delay);
                }
            }
        }
    }

    /// Run an operation with reconnect-and-retry on classified connection
    /// errors (up to `operation_retries`, backoff doubling up to the cap).
    /// Non-connection errors surface immediately.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<Client>) -> Fut,
        Fut: Future<Output = std::result::Result<T, tokio_postgres::Error>>,
    {
        let mut delay = self.config.reconnect_delay;
        let mut last_err = None;

        for attempt in 0..=self.config.operation_retries {
            if attempt > 0 {
                sleep(delay).await;
                delay = (delay * 2).min(self.config.max_reconnect_delay);
            }

            let client = match self.acquire().await {
                Ok(client) => client,
                Err(err) => {
                    warn!(attempt, error = %err, "could not acquire database connection");
                    last_err = Some(err);
                    continue;
                }
            };

            match op(Arc::clone(&client)).await {
                Ok(value) => return Ok(value),
                Err(err) if is_connection_error(&err) => {
                    warn!(attempt, error = %err, "database operation hit connection error");
                    self.invalidate(&client).await;
                    last_err = Some(InflowError::DatabaseUnavailable(err.to_string()));
                }
                Err(err) => return Err(InflowError::Database(err.to_string())),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            InflowError::DatabaseUnavailable("database operation retries exhausted".into())
        }))
    }

    /// Run an operation exactly once against the current (or one freshly
    /// acquired) connection. Connection failures map to
    /// [`InflowError::DatabaseUnavailable`] without any retry or sleep.
    pub async fn execute_once<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Arc<Client>) -> Fut,
        Fut: Future<Output = std::result::Result<T, tokio_postgres::Error>>,
    {
        let client = self.try_acquire().await?;
        match op(Arc::clone(&client)).await {
            Ok(value) => Ok(value),
            Err(err) if is_connection_error(&err) => {
                self.invalidate(&client).await;
                Err(InflowError::DatabaseUnavailable(err.to_string()))
            }
            Err(err) => Err(InflowError::Database(err.to_string())),
        }
    }
}

#[async_trait]
impl DatabaseProbe for DbSession {
    /// Cheap liveness probe used by `/health` and the supervisor.
    async fn is_connected(&self) -> bool {
        let client = match self.try_acquire().await {
            Ok(client) => client,
            Err(_) => return false,
        };
        match client.simple_query("SELECT 1").await {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "database probe failed");
                self.invalidate(&client).await;
                false
            }
        }
    }
}
