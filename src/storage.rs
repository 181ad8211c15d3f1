//! Storage Layer
//!
//! Catalog persistence on a document store, with the query pipeline on top:
//! - **Schema**: typed records and their canonical stored shape
//! - **Filter compiler**: client filters to validated, store-native predicates
//! - **Pagination**: stable sort, clamped page sizes and opaque cursors
//! - **Response assembly**: projection and canonical rendering
//! - **Connection manager**: one shared, lazily (re)established store handle
//!
//! # Components
//!
//! - [`CatalogReader`]: filtered, paginated queries and lookups
//! - [`CatalogWriter`]: validated create/update/delete
//! - [`StorageAdmin`]: health checks and connection lifecycle
//! - [`StorageBuilder`] / [`StorageHandles`]: initialization and lifecycle management

mod builder;
pub mod db;
mod error;
mod facades;
mod filter;
mod pagination;
mod pool;
mod response;
mod schema;
mod types;

pub use builder::{StorageBuilder, StorageHandles};
pub use db::{Connector, DocumentStore, MemoryConnector, MemoryStore, MongoConnector, MongoStore};
pub use error::{FilterError, PaginationError, StorageError, ValidationError};
pub use facades::{CatalogReader, CatalogWriter, StorageAdmin, TimeExtent, TimeExtreme};
pub use filter::{Comparison, Condition, FilterCompiler, FilterSpec, Operator, Predicate};
pub use pagination::{
    DEFAULT_PAGE_SIZE, DEFAULT_SORT_KEY, MAX_PAGE_SIZE, PageLimits, PagePlan, PaginationSpec,
    Paginator, ResultPage, SortDirection,
};
pub use pool::{ConnectionHandle, ConnectionManager, RetryPolicy};
pub use response::{PageInfo, Projection, ResponseAssembler, ResponsePayload, format_timestamp};
pub use schema::{FieldDef, FieldKind, Schema};
pub use types::{
    CatalogRecord, LineString, Parameter, ParameterKind, ParameterValue, Polygon, Position,
    RecordPatch, truncate_millis,
};
