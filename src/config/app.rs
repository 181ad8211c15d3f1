//! Catalog configuration structures.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::{PageLimits, ParameterKind, RetryPolicy, Schema};

use super::validation::{
    ConfigError, display_duration, require_non_empty, require_positive, validate_url,
};

// =============================================================================
// Constants
// =============================================================================

/// Default database name.
pub const DEFAULT_DATABASE_NAME: &str = "satellite_database";

/// Default collection name.
pub const DEFAULT_COLLECTION_NAME: &str = "files";

/// Default per-attempt connect timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default query timeout (30 seconds).
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

fn default_database_name() -> String {
    DEFAULT_DATABASE_NAME.to_string()
}

fn default_collection_name() -> String {
    DEFAULT_COLLECTION_NAME.to_string()
}

fn default_app_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_query_timeout() -> Duration {
    DEFAULT_QUERY_TIMEOUT
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Document store endpoint and credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection string, e.g. `mongodb://localhost:27017`.
    pub url: String,

    #[serde(default = "default_database_name")]
    pub name: String,

    #[serde(default = "default_collection_name")]
    pub collection: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Reported to the server for diagnostics.
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Per-attempt connect timeout (default: "5s").
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Upper bound on any single store call (default: "30s").
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,

    /// Create the catalog indexes on connect (default: true).
    #[serde(default = "default_true")]
    pub ensure_indexes: bool,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url)
            .field("name", &self.name)
            .field("collection", &self.collection)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("app_name", &self.app_name)
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout", &self.query_timeout)
            .field("ensure_indexes", &self.ensure_indexes)
            .finish()
    }
}

impl DatabaseConfig {
    /// Configuration for `url` with every other setting at its default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: default_database_name(),
            collection: default_collection_name(),
            username: None,
            password: None,
            app_name: default_app_name(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            ensure_indexes: true,
        }
    }
}

// =============================================================================
// Retry Configuration
// =============================================================================

/// Connection retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total connection attempts (default: 5).
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff: policy.initial_backoff,
            max_backoff: policy.max_backoff,
            jitter: policy.jitter,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            jitter: config.jitter,
        }
    }
}

// =============================================================================
// Pagination Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        let limits = PageLimits::default();
        Self {
            default_page_size: limits.default_page_size,
            max_page_size: limits.max_page_size,
        }
    }
}

impl From<&PaginationConfig> for PageLimits {
    fn from(config: &PaginationConfig) -> Self {
        Self {
            default_page_size: config.default_page_size,
            max_page_size: config.max_page_size,
        }
    }
}

// =============================================================================
// Catalog Configuration
// =============================================================================

/// Top-level catalog configuration.
///
/// Supplied by the embedding process; nothing here is read from files or
/// the environment by the library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub database: DatabaseConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub pagination: PaginationConfig,

    /// Declared parameter types, making `parameters.<name>` filterable.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterKind>,
}

impl CatalogConfig {
    /// Configuration for `url` with defaults everywhere else.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::new(url),
            retry: RetryConfig::default(),
            pagination: PaginationConfig::default(),
            parameters: BTreeMap::new(),
        }
    }

    /// Parse and validate a YAML document.
    ///
    /// # Errors
    /// Returns `ConfigError` if the text cannot be parsed or fails validation.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url(&self.database.url)?;
        require_non_empty("database.name", &self.database.name)?;
        require_non_empty("database.collection", &self.database.collection)?;
        require_positive("database.connect_timeout", self.database.connect_timeout)?;
        require_positive("database.query_timeout", self.database.query_timeout)?;

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        require_positive("retry.initial_backoff", self.retry.initial_backoff)?;
        if self.retry.max_backoff < self.retry.initial_backoff {
            return Err(ConfigError::ValidationError(format!(
                "retry.max_backoff ({}) must not be less than retry.initial_backoff ({})",
                display_duration(self.retry.max_backoff),
                display_duration(self.retry.initial_backoff),
            )));
        }

        let pagination = &self.pagination;
        if pagination.max_page_size == 0 {
            return Err(ConfigError::ValidationError(
                "pagination.max_page_size must be at least 1".to_string(),
            ));
        }
        if pagination.default_page_size == 0
            || pagination.default_page_size > pagination.max_page_size
        {
            return Err(ConfigError::ValidationError(format!(
                "pagination.default_page_size must be within [1, {}], got {}",
                pagination.max_page_size, pagination.default_page_size
            )));
        }

        for name in self.parameters.keys() {
            if name.trim().is_empty() || name.contains('.') || name.starts_with('$') {
                return Err(ConfigError::ValidationError(format!(
                    "invalid parameter name '{name}'"
                )));
            }
        }

        Ok(())
    }

    /// The catalog schema including declared parameters.
    pub fn schema(&self) -> Schema {
        self.parameters
            .iter()
            .fold(Schema::new(), |schema, (name, kind)| {
                schema.with_parameter(name, *kind)
            })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    pub fn page_limits(&self) -> PageLimits {
        PageLimits::from(&self.pagination)
    }
}
