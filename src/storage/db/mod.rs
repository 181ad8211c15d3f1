//! Document store abstraction.
//!
//! The catalog core talks to its store through [`DocumentStore`]; a
//! [`Connector`] knows how to establish one. Two backends exist:
//! - [`MongoConnector`] / [`MongoStore`]: MongoDB via the official driver
//! - [`MemoryConnector`] / [`MemoryStore`]: in-process, used by tests and
//!   for simulating outages
//!
//! Documents exchanged here are raw stored documents; schema validation
//! happens above this layer.
//!
//! # Example
//!
//! ```ignore
//! let connector = MongoConnector::new(config.database.clone(), schema.indexes());
//! let store = connector.connect().await?;
//! store.ping().await?;
//! ```

mod memory;
mod mongo;

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::storage::StorageError;
use crate::storage::filter::Predicate;
use crate::storage::pagination::PagePlan;

pub use memory::{MemoryConnector, MemoryStore};
pub use mongo::{MongoConnector, MongoStore};

/// Operations the catalog needs from a document store.
///
/// Records are addressed by their `uid` field.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Lightweight round-trip.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Insert a new document. Fails with `DuplicateKey` on a `uid` collision.
    async fn insert(&self, doc: Document) -> Result<(), StorageError>;

    async fn find_one(&self, uid: &str) -> Result<Option<Document>, StorageError>;

    /// Matching documents in plan order, windowed by the plan's offset and limit.
    async fn find(&self, predicate: &Predicate, plan: &PagePlan)
    -> Result<Vec<Document>, StorageError>;

    async fn count(&self, predicate: &Predicate) -> Result<u64, StorageError>;

    /// Replace the document only if its revision still equals `expected_revision`.
    ///
    /// Returns `false` when the document is gone or was changed meanwhile.
    async fn replace(
        &self,
        uid: &str,
        expected_revision: i64,
        doc: Document,
    ) -> Result<bool, StorageError>;

    /// Returns `false` when no document had that uid.
    async fn delete(&self, uid: &str) -> Result<bool, StorageError>;

    /// Distinct values at `path` among matching documents. Array fields
    /// contribute their elements.
    async fn distinct(&self, path: &str, predicate: &Predicate) -> Result<Vec<Bson>, StorageError>;
}

/// Establishes store handles for the connection manager.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Store: DocumentStore;

    /// Make one connection attempt.
    async fn connect(&self) -> Result<Self::Store, StorageError>;
}
