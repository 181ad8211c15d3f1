//! Configuration for the catalog.
//!
//! Provides YAML-parsable configuration and validation for:
//! - Database settings (endpoint, credentials, timeouts, indexes)
//! - Connection retry policy
//! - Page-size limits
//! - Declared parameter types

mod app;
mod validation;

pub use app::{CatalogConfig, DatabaseConfig, PaginationConfig, RetryConfig};
pub use validation::ConfigError;

// Re-export constants
pub use app::{
    DEFAULT_COLLECTION_NAME, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DATABASE_NAME, DEFAULT_QUERY_TIMEOUT,
};
