//! MongoDB backend using the official driver.

use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, Credential};
use mongodb::{Client, Collection, IndexModel};
use tracing::{debug, info};

use super::{Connector, DocumentStore};
use crate::config::DatabaseConfig;
use crate::storage::StorageError;
use crate::storage::error::DUPLICATE_KEY_CODE;
use crate::storage::filter::Predicate;
use crate::storage::pagination::PagePlan;
use crate::storage::schema::REVISION_FIELD;

/// Connects to MongoDB and prepares the catalog collection.
#[derive(Clone)]
pub struct MongoConnector {
    config: DatabaseConfig,
    indexes: Vec<IndexModel>,
}

impl std::fmt::Debug for MongoConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoConnector")
            .field("database", &self.config.name)
            .field("collection", &self.config.collection)
            .finish_non_exhaustive()
    }
}

impl MongoConnector {
    /// `indexes` are created on connect when `ensure_indexes` is set.
    pub fn new(config: DatabaseConfig, indexes: Vec<IndexModel>) -> Self {
        Self { config, indexes }
    }

    async fn client_options(&self) -> Result<ClientOptions, StorageError> {
        let mut options = ClientOptions::parse(self.config.url.as_str()).await?;
        options.app_name = Some(self.config.app_name.clone());
        options.connect_timeout = Some(self.config.connect_timeout);
        options.server_selection_timeout = Some(self.config.connect_timeout);
        if let Some(username) = &self.config.username {
            options.credential = Some(
                Credential::builder()
                    .username(username.clone())
                    .password(self.config.password.clone())
                    .build(),
            );
        }
        Ok(options)
    }
}

#[async_trait]
impl Connector for MongoConnector {
    type Store = MongoStore;

    async fn connect(&self) -> Result<MongoStore, StorageError> {
        let client = Client::with_options(self.client_options().await?)?;
        let database = client.database(&self.config.name);

        // Fail early: the driver connects lazily otherwise.
        database.run_command(doc! { "ping": 1 }).await?;

        let collection = database.collection::<Document>(&self.config.collection);
        if self.config.ensure_indexes && !self.indexes.is_empty() {
            collection.create_indexes(self.indexes.clone()).await?;
            debug!(count = self.indexes.len(), "Ensured catalog indexes");
        }

        info!(
            database = %self.config.name,
            collection = %self.config.collection,
            "Connected to MongoDB"
        );

        Ok(MongoStore {
            client,
            collection,
            query_timeout: self.config.query_timeout,
        })
    }
}

/// A connected catalog collection. Cheap to clone; the driver pools internally.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    collection: Collection<Document>,
    query_timeout: Duration,
}

impl std::fmt::Debug for MongoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoStore")
            .field("collection", &self.collection.name())
            .finish_non_exhaustive()
    }
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    matches!(
        e.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY_CODE
    )
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn ping(&self) -> Result<(), StorageError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        Ok(())
    }

    async fn insert(&self, doc: Document) -> Result<(), StorageError> {
        let uid = doc.get_str("uid").unwrap_or_default().to_string();
        match self.collection.insert_one(doc).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(StorageError::DuplicateKey { uid }),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_one(&self, uid: &str) -> Result<Option<Document>, StorageError> {
        Ok(self
            .collection
            .find_one(doc! { "uid": uid })
            .max_time(self.query_timeout)
            .await?)
    }

    async fn find(
        &self,
        predicate: &Predicate,
        plan: &PagePlan,
    ) -> Result<Vec<Document>, StorageError> {
        let filter = predicate.to_document();
        let sort = plan.sort_document();
        debug!(%filter, %sort, skip = plan.offset, limit = plan.limit, "Executing find");

        let cursor = self
            .collection
            .find(filter)
            .sort(sort)
            .skip(plan.offset)
            .limit(i64::from(plan.limit))
            .max_time(self.query_timeout)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn count(&self, predicate: &Predicate) -> Result<u64, StorageError> {
        Ok(self
            .collection
            .count_documents(predicate.to_document())
            .max_time(self.query_timeout)
            .await?)
    }

    async fn replace(
        &self,
        uid: &str,
        expected_revision: i64,
        doc: Document,
    ) -> Result<bool, StorageError> {
        // Documents written before revisions existed carry no counter.
        let revision_filter = if expected_revision == 0 {
            doc! { "$in": [0_i64, Bson::Null] }
        } else {
            doc! { "$eq": expected_revision }
        };
        let result = self
            .collection
            .replace_one(doc! { "uid": uid, REVISION_FIELD: revision_filter }, doc)
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn delete(&self, uid: &str) -> Result<bool, StorageError> {
        let result = self.collection.delete_one(doc! { "uid": uid }).await?;
        Ok(result.deleted_count == 1)
    }

    async fn distinct(&self, path: &str, predicate: &Predicate) -> Result<Vec<Bson>, StorageError> {
        Ok(self
            .collection
            .distinct(path, predicate.to_document())
            .max_time(self.query_timeout)
            .await?)
    }
}
