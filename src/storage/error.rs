//! Storage-specific error types.
//!
//! All catalog operations return [`StorageError`] on failure. Client input
//! problems are grouped into [`FilterError`], [`PaginationError`] and
//! [`ValidationError`] so callers can build a precise message from the
//! offending field and value.

use std::time::Duration;

use thiserror::Error;

/// A filter expression could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// The field is not part of the catalog schema.
    #[error("unknown field '{field}'")]
    UnknownField { field: String },

    /// The operator is not legal for the field's declared type.
    #[error("operator '{operator}' is not allowed on field '{field}'")]
    IncompatibleOperator { field: String, operator: String },

    /// The value could not be coerced to the field's declared type.
    #[error("invalid value {value} for field '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    /// The operator name is not recognised.
    #[error("unknown operator '{operator}'")]
    UnknownOperator { operator: String },
}

/// Paging parameters were rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaginationError {
    #[error("invalid page size {0}: must be positive")]
    InvalidPageSize(i64),

    #[error("invalid offset {0}: must not be negative")]
    InvalidOffset(i64),

    #[error("field '{0}' cannot be used as a sort key")]
    InvalidSortKey(String),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
}

/// A record failed schema validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}' must be {expected}")]
    InvalidType { field: String, expected: String },

    #[error("invalid value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("end_time {end} precedes start_time {start}")]
    TimeOrder { start: String, end: String },

    #[error("record must have at least one uri")]
    EmptyUris,
}

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store stayed unreachable for the whole retry budget.
    #[error("store unreachable after {attempts} attempt(s): {message}")]
    Connection { attempts: u32, message: String },

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Pagination(#[from] PaginationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A record with the same uid already exists.
    #[error("a record with uid '{uid}' already exists")]
    DuplicateKey { uid: String },

    #[error("no record with uid '{uid}'")]
    NotFound { uid: String },

    /// Concurrent writers kept winning the compare-and-swap.
    #[error("record '{uid}' was modified concurrently, giving up")]
    Conflict { uid: String },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A stored document no longer passes the schema.
    #[error("stored record '{uid}' is corrupt: {source}")]
    CorruptRecord {
        uid: String,
        #[source]
        source: ValidationError,
    },

    /// Database driver error.
    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Whether the failure is connection-class, so the cached handle should
    /// be torn down and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout(_) => true,
            Self::Database(e) => is_transient_driver_error(e),
            _ => false,
        }
    }

    /// Whether the failure means the store handle itself is unusable.
    ///
    /// A timed-out call says nothing about the connection, so it does not
    /// count.
    pub fn breaks_connection(&self) -> bool {
        self.is_retryable() && !matches!(self, Self::Timeout(_))
    }
}

fn is_transient_driver_error(e: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;

    matches!(
        *e.kind,
        ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::DnsResolve { .. }
    ) || e.contains_label(mongodb::error::RETRYABLE_WRITE_ERROR)
}

/// Duplicate-key write error code reported by the server.
pub(crate) const DUPLICATE_KEY_CODE: i32 = 11000;
