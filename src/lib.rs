//! Satcat - Satellite Data Product Catalog
//!
//! This crate records the identifying metadata of processed satellite data
//! products (type, format, platform, time range, coverage, storage URIs,
//! tags and typed parameters) in a document store, and answers structured
//! queries over it.
//!
//! # Architecture
//!
//! - **Filter compiler**: validates loosely-typed client filters against the
//!   schema and compiles them to store-native predicates
//! - **Pagination**: stable, clamped, cursor-capable paging
//! - **Response assembly**: projections and canonical timestamps
//! - **Connection manager**: a single shared store connection with retry,
//!   backoff and health checks
//! - **Backends**: MongoDB, plus an in-memory store for tests
//!
//! # Example
//!
//! ```rust,ignore
//! use satcat::{CatalogConfig, FilterSpec, Operator, PaginationSpec, Projection, StorageBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CatalogConfig::from_yaml(&std::fs::read_to_string("catalog.yaml")?)?;
//!     let handles = StorageBuilder::mongo(&config)?.connect().await?;
//!
//!     let filter = FilterSpec::all_of(vec![
//!         FilterSpec::eq("platform_name", "NOAA-19"),
//!         FilterSpec::condition("start_time", Operator::Gte, "2024-01-01T00:00:00Z"),
//!     ]);
//!     let page = handles
//!         .reader
//!         .query(&filter, &PaginationSpec::default().with_page_size(20), &Projection::all())
//!         .await?;
//!     println!("{}", serde_json::to_string_pretty(&page)?);
//!
//!     handles.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod storage;

pub use config::{CatalogConfig, ConfigError, DatabaseConfig, PaginationConfig, RetryConfig};
pub use storage::{
    CatalogReader, CatalogRecord, CatalogWriter, FilterError, FilterSpec, LineString, Operator,
    PaginationError, PaginationSpec, Parameter, ParameterKind, ParameterValue, Polygon,
    Projection, RecordPatch, ResponsePayload, ResultPage, Schema, SortDirection, StorageAdmin,
    StorageBuilder, StorageError, StorageHandles, TimeExtent, ValidationError,
};
