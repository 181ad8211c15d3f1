//! Connection lifecycle.
//!
//! [`ConnectionManager`] owns the single shared store handle. It connects
//! lazily, retries with exponential backoff and jitter, caches the handle
//! for every caller, and tears it down when a health check or a
//! connection-class failure says it is no longer usable.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::storage::StorageError;
use crate::storage::db::{Connector, DocumentStore};

/// A handle to a live store, shared by all in-flight operations.
pub type ConnectionHandle<S> = Arc<S>;

/// Backoff schedule for connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts before giving up (at least one is made).
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Add up to 25% random jitter to each backoff.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given zero-based failed attempt: `initial * 2^attempt`,
    /// capped at `max_backoff`, plus jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);

        if !self.jitter || base.is_zero() {
            return base;
        }
        let jitter_ms = (base.as_millis() / 4) as u64;
        base.saturating_add(Duration::from_millis(
            rand::rng().random_range(0..=jitter_ms),
        ))
    }
}

/// Owns the cached store handle.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    policy: RetryPolicy,
    connect_timeout: Duration,
    handle: Mutex<Option<ConnectionHandle<C::Store>>>,
}

impl<C: Connector> std::fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("policy", &self.policy)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, policy: RetryPolicy, connect_timeout: Duration) -> Self {
        Self {
            connector,
            policy,
            connect_timeout,
            handle: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Return the cached handle, connecting first if there is none.
    ///
    /// Callers that find no handle queue behind the one connect in progress.
    pub async fn acquire(&self) -> Result<ConnectionHandle<C::Store>, StorageError> {
        let mut guard = self.handle.lock().await;
        if let Some(store) = guard.as_ref() {
            return Ok(Arc::clone(store));
        }
        let store = self.connect_with_retry().await?;
        *guard = Some(Arc::clone(&store));
        Ok(store)
    }

    async fn connect_once(&self) -> Result<C::Store, StorageError> {
        match timeout(self.connect_timeout, self.connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(self.connect_timeout)),
        }
    }

    async fn connect_with_retry(&self) -> Result<ConnectionHandle<C::Store>, StorageError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match self.connect_once().await {
                Ok(store) => {
                    info!(attempt = attempt + 1, "Store connection established");
                    return Ok(Arc::new(store));
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => last_error = e.to_string(),
            }

            if attempt + 1 < attempts {
                let backoff = self.policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %last_error,
                    "Connection attempt failed, backing off"
                );
                sleep(backoff).await;
            }
        }

        warn!(attempts, error = %last_error, "Store unreachable, giving up");
        Err(StorageError::Connection {
            attempts,
            message: last_error,
        })
    }

    /// Round-trip to the store. Never fails; a dead handle is torn down.
    ///
    /// With no cached handle a single connection attempt is made.
    pub async fn health_check(&self) -> bool {
        let mut guard = self.handle.lock().await;
        let store = match guard.as_ref() {
            Some(store) => Arc::clone(store),
            None => match self.connect_once().await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!(error = %e, "Health check could not connect");
                    return false;
                }
            },
        };

        let result = match timeout(self.connect_timeout, store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(self.connect_timeout)),
        };
        match result {
            Ok(()) => {
                *guard = Some(store);
                true
            }
            Err(e) => {
                warn!(error = %e, "Health check failed, tearing down connection");
                *guard = None;
                false
            }
        }
    }

    /// Drop the cached handle; the next `acquire` reconnects.
    pub async fn invalidate(&self) {
        if self.handle.lock().await.take().is_some() {
            info!("Store connection torn down");
        }
    }

    /// Tear down and connect again now.
    pub async fn reconnect(&self) -> Result<(), StorageError> {
        self.invalidate().await;
        self.acquire().await.map(|_| ())
    }

    /// Drop the cached handle only if it is still `failed`.
    ///
    /// A handle that replaced it meanwhile is left alone.
    pub async fn discard(&self, failed: &ConnectionHandle<C::Store>) {
        let mut guard = self.handle.lock().await;
        if guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, failed)) {
            *guard = None;
            info!("Store connection torn down");
        }
    }

    /// Release the handle. In-flight operations keep their own clone.
    pub async fn close(&self) {
        if self.handle.lock().await.take().is_some() {
            info!("Store connection closed");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.handle.lock().await.is_some()
    }
}
