//! Storage builder and handles.
//!
//! Provides a builder pattern for wiring a connector, schema and limits
//! into one shared catalog context, and a handles struct for accessing
//! the facades built on it.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{CatalogConfig, ConfigError, DEFAULT_CONNECT_TIMEOUT, DEFAULT_QUERY_TIMEOUT};
use crate::storage::StorageError;
use crate::storage::db::{Connector, MongoConnector};
use crate::storage::facades::{CatalogContext, CatalogReader, CatalogWriter, StorageAdmin};
use crate::storage::pagination::PageLimits;
use crate::storage::pool::{ConnectionManager, RetryPolicy};
use crate::storage::schema::Schema;

/// Builder for constructing the catalog storage layer.
pub struct StorageBuilder<C: Connector> {
    connector: C,
    schema: Schema,
    limits: PageLimits,
    retry: RetryPolicy,
    connect_timeout: Duration,
    query_timeout: Duration,
}

impl<C: Connector> std::fmt::Debug for StorageBuilder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageBuilder")
            .field("limits", &self.limits)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl StorageBuilder<MongoConnector> {
    /// Builder for a MongoDB-backed catalog described by `config`.
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration fails validation.
    pub fn mongo(config: &CatalogConfig) -> Result<Self, ConfigError> {
        let indexes = config.schema().indexes();
        Self::from_config(MongoConnector::new(config.database.clone(), indexes), config)
    }
}

impl<C: Connector> StorageBuilder<C> {
    /// Create a builder with default schema, limits and retry policy.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            schema: Schema::new(),
            limits: PageLimits::default(),
            retry: RetryPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Create a builder taking every setting from `config`.
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration fails validation.
    pub fn from_config(connector: C, config: &CatalogConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(connector)
            .schema(config.schema())
            .page_limits(config.page_limits())
            .retry_policy(config.retry_policy())
            .connect_timeout(config.database.connect_timeout)
            .query_timeout(config.database.query_timeout))
    }

    /// Set the schema, e.g. one extended with declared parameters.
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn page_limits(mut self, limits: PageLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set the per-attempt connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the upper bound on any single store call.
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Build the handles. The store is connected lazily on first use.
    pub fn build(self) -> StorageHandles<C> {
        let ctx = Arc::new(CatalogContext {
            manager: ConnectionManager::new(self.connector, self.retry, self.connect_timeout),
            schema: self.schema,
            limits: self.limits,
            query_timeout: self.query_timeout,
        });

        StorageHandles {
            reader: CatalogReader::new(Arc::clone(&ctx)),
            writer: CatalogWriter::new(Arc::clone(&ctx)),
            admin: StorageAdmin::new(ctx),
        }
    }

    /// Build the handles and connect right away, failing early if the
    /// store is unreachable.
    pub async fn connect(self) -> Result<StorageHandles<C>, StorageError> {
        let handles = self.build();
        handles.admin.reconnect().await?;
        Ok(handles)
    }
}

/// Handles to all catalog facades. All of them share one connection.
pub struct StorageHandles<C: Connector> {
    /// Facade for queries and lookups.
    pub reader: CatalogReader<C>,
    /// Facade for creating, updating and deleting records.
    pub writer: CatalogWriter<C>,
    /// Facade for connection lifecycle.
    pub admin: StorageAdmin<C>,
}

impl<C: Connector> StorageHandles<C> {
    /// Release the shared connection.
    pub async fn shutdown(self) {
        self.admin.close().await;
    }
}
