//! User-facing catalog facades.
//!
//! Provides the query and mutation surface over a shared connection:
//! - `CatalogReader`: filtered, paginated queries and single-record lookups
//! - `CatalogWriter`: create, update and delete records
//! - `StorageAdmin`: health checks and connection lifecycle
//!
//! Every store call runs under the configured query timeout. Dropping the
//! returned future abandons the in-flight call.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::storage::StorageError;
use crate::storage::db::{Connector, DocumentStore};
use crate::storage::error::FilterError;
use crate::storage::filter::{Comparison, FilterCompiler, FilterSpec, Predicate, lookup};
use crate::storage::pagination::{
    PageLimits, PagePlan, PaginationSpec, Paginator, ResultPage, SortDirection,
};
use crate::storage::pool::{ConnectionHandle, ConnectionManager};
use crate::storage::response::{Projection, ResponseAssembler, ResponsePayload};
use crate::storage::schema::{self, FieldKind, REVISION_FIELD, Schema};
use crate::storage::types::{CatalogRecord, RecordPatch};

// =============================================================================
// Constants
// =============================================================================

/// Compare-and-swap attempts before an update gives up with `Conflict`.
const MAX_UPDATE_ATTEMPTS: u32 = 5;

// =============================================================================
// Shared context
// =============================================================================

/// State shared by all facades of one catalog.
pub(crate) struct CatalogContext<C: Connector> {
    pub(crate) manager: ConnectionManager<C>,
    pub(crate) schema: Schema,
    pub(crate) limits: PageLimits,
    pub(crate) query_timeout: Duration,
}

impl<C: Connector> CatalogContext<C> {
    /// One store call on `store` under the query timeout. A failure that
    /// breaks the connection tears that handle down.
    async fn run<T, Fut>(
        &self,
        op: &'static str,
        store: &ConnectionHandle<C::Store>,
        call: Fut,
    ) -> Result<T, StorageError>
    where
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let error = match timeout(self.query_timeout, call).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => StorageError::Timeout(self.query_timeout),
        };
        if error.breaks_connection() {
            warn!(op, error = %error, "Store call failed, dropping connection");
            self.manager.discard(store).await;
        }
        Err(error)
    }

    /// Run `call` on a live handle, retrying connection failures with
    /// backoff until the retry budget is spent.
    ///
    /// The flag passed to `call` is set once an earlier attempt has failed;
    /// that attempt may still have been applied.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, StorageError>
    where
        F: Fn(ConnectionHandle<C::Store>, bool) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let policy = *self.manager.policy();
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let store = self.manager.acquire().await?;
            let result = self.run(op, &store, call(Arc::clone(&store), attempt > 0)).await;
            match result {
                Err(e) if e.breaks_connection() => {
                    attempt += 1;
                    if attempt >= attempts {
                        return Err(StorageError::Connection {
                            attempts,
                            message: e.to_string(),
                        });
                    }
                    let backoff = policy.backoff(attempt - 1);
                    debug!(
                        op,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Retrying store call"
                    );
                    sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    fn decode(&self, raw: &Document) -> Result<CatalogRecord, StorageError> {
        self.schema
            .validate(raw)
            .map_err(|source| StorageError::CorruptRecord {
                uid: raw.get_str("uid").unwrap_or("<unknown>").to_string(),
                source,
            })
    }

    async fn find_raw(&self, uid: &str) -> Result<Document, StorageError> {
        self.with_retry("find_one", |store, _| async move { store.find_one(uid).await })
            .await?
            .ok_or_else(|| StorageError::NotFound {
                uid: uid.to_string(),
            })
    }
}

/// Document equality ignoring the store-assigned `_id`.
fn same_document(stored: &Document, sent: &Document) -> bool {
    fn strip(d: &Document) -> BTreeMap<&String, &Bson> {
        d.iter()
            .filter(|(k, _)| k.as_str() != "_id")
            .collect::<BTreeMap<_, _>>()
    }
    strip(stored) == strip(sent)
}

// =============================================================================
// Result Types
// =============================================================================

/// One extreme of a time field with the record holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeExtreme {
    pub uid: String,
    pub time: DateTime<Utc>,
}

/// Earliest and latest start/end times among matching records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeExtent {
    pub earliest_start: Option<TimeExtreme>,
    pub latest_start: Option<TimeExtreme>,
    pub earliest_end: Option<TimeExtreme>,
    pub latest_end: Option<TimeExtreme>,
}

// =============================================================================
// Reader
// =============================================================================

/// Query facade.
pub struct CatalogReader<C: Connector> {
    ctx: Arc<CatalogContext<C>>,
}

impl<C: Connector> Clone for CatalogReader<C> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<C: Connector> std::fmt::Debug for CatalogReader<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogReader").finish_non_exhaustive()
    }
}

impl<C: Connector> CatalogReader<C> {
    pub(crate) fn new(ctx: Arc<CatalogContext<C>>) -> Self {
        Self { ctx }
    }

    pub fn schema(&self) -> &Schema {
        &self.ctx.schema
    }

    /// Compile a filter against this catalog's schema. Pure.
    pub fn compile(&self, filter: &FilterSpec) -> Result<Predicate, FilterError> {
        FilterCompiler::new(&self.ctx.schema).compile(filter)
    }

    /// Build a projection validated against this catalog's schema.
    pub fn projection<I, S>(&self, fields: I) -> Result<Projection, FilterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Projection::fields(&self.ctx.schema, fields)
    }

    /// Filter, page and shape records in one call.
    pub async fn query(
        &self,
        filter: &FilterSpec,
        pagination: &PaginationSpec,
        projection: &Projection,
    ) -> Result<ResponsePayload, StorageError> {
        let page = self.search(filter, pagination).await?;
        Ok(ResponseAssembler.assemble(&page, projection))
    }

    /// Filter and page records.
    pub async fn search(
        &self,
        filter: &FilterSpec,
        pagination: &PaginationSpec,
    ) -> Result<ResultPage, StorageError> {
        let predicate = self.compile(filter)?;
        self.paginate(&predicate, pagination).await
    }

    /// Execute a compiled predicate with sort, skip and limit.
    ///
    /// The total, when requested, comes from a separate count on the same
    /// predicate.
    pub async fn paginate(
        &self,
        predicate: &Predicate,
        pagination: &PaginationSpec,
    ) -> Result<ResultPage, StorageError> {
        let plan = Paginator::new(&self.ctx.schema, self.ctx.limits).plan(pagination)?;
        debug!(
            sort_key = %plan.sort_key,
            direction = %plan.direction,
            offset = plan.offset,
            limit = plan.limit,
            "Planned page"
        );

        let plan_ref = &plan;
        let raw = self
            .ctx
            .with_retry("find", |store, _| async move { store.find(predicate, plan_ref).await })
            .await?;
        let total = if plan.include_total {
            Some(
                self.ctx
                    .with_retry("count", |store, _| async move { store.count(predicate).await })
                    .await?,
            )
        } else {
            None
        };

        let records = raw
            .iter()
            .map(|doc| self.ctx.decode(doc))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ResultPage {
            next_cursor: plan.next_cursor(records.len(), total),
            page_size: plan.limit,
            offset: plan.offset,
            records,
            total,
        })
    }

    /// Look up a single record.
    pub async fn record(&self, uid: &str) -> Result<CatalogRecord, StorageError> {
        let raw = self.ctx.find_raw(uid).await?;
        self.ctx.decode(&raw)
    }

    /// Look up a single record and render it with a projection.
    pub async fn get(&self, uid: &str, projection: &Projection) -> Result<Value, StorageError> {
        let record = self.record(uid).await?;
        Ok(ResponseAssembler.render(&record, projection))
    }

    /// Sorted distinct values of a keyword field among matching records.
    pub async fn distinct(
        &self,
        field: &str,
        filter: &FilterSpec,
    ) -> Result<Vec<String>, StorageError> {
        let def = self
            .ctx
            .schema
            .field(field)
            .ok_or_else(|| FilterError::UnknownField {
                field: field.to_string(),
            })?;
        if !matches!(def.kind, FieldKind::Keyword | FieldKind::KeywordSet) {
            return Err(FilterError::IncompatibleOperator {
                field: field.to_string(),
                operator: "distinct".to_string(),
            }
            .into());
        }
        let path = def.path.clone();
        let predicate = self.compile(filter)?;

        let (path_ref, predicate_ref) = (path.as_str(), &predicate);
        let values = self
            .ctx
            .with_retry("distinct", |store, _| async move {
                store.distinct(path_ref, predicate_ref).await
            })
            .await?;

        let mut out: Vec<String> = values
            .into_iter()
            .filter_map(|v| match v {
                Bson::String(s) => Some(s),
                _ => None,
            })
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Earliest and latest `start_time` and `end_time` among matching records.
    pub async fn time_extent(&self, filter: &FilterSpec) -> Result<TimeExtent, StorageError> {
        let predicate = self.compile(filter)?;
        Ok(TimeExtent {
            earliest_start: self
                .extreme(&predicate, "start_time", SortDirection::Asc)
                .await?,
            latest_start: self
                .extreme(&predicate, "start_time", SortDirection::Desc)
                .await?,
            earliest_end: self.extreme(&predicate, "end_time", SortDirection::Asc).await?,
            latest_end: self.extreme(&predicate, "end_time", SortDirection::Desc).await?,
        })
    }

    async fn extreme(
        &self,
        predicate: &Predicate,
        field: &str,
        direction: SortDirection,
    ) -> Result<Option<TimeExtreme>, StorageError> {
        // Only records that carry the field take part.
        let predicate = Predicate::And(vec![
            predicate.clone(),
            Predicate::Compare {
                path: field.to_string(),
                op: Comparison::Gte,
                value: Bson::DateTime(bson::DateTime::MIN),
            },
        ]);
        let plan = PagePlan {
            sort_key: field.to_string(),
            sort_path: field.to_string(),
            direction,
            offset: 0,
            limit: 1,
            include_total: false,
        };

        let (predicate_ref, plan_ref) = (&predicate, &plan);
        let raw = self
            .ctx
            .with_retry("time_extent", |store, _| async move {
                store.find(predicate_ref, plan_ref).await
            })
            .await?;

        Ok(raw.first().and_then(|doc| {
            let time = match lookup(doc, field)? {
                Bson::DateTime(dt) => dt.to_chrono(),
                _ => return None,
            };
            Some(TimeExtreme {
                uid: doc.get_str("uid").ok()?.to_string(),
                time,
            })
        }))
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Mutation facade. Every write is validated first.
pub struct CatalogWriter<C: Connector> {
    ctx: Arc<CatalogContext<C>>,
}

impl<C: Connector> Clone for CatalogWriter<C> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<C: Connector> std::fmt::Debug for CatalogWriter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogWriter").finish_non_exhaustive()
    }
}

impl<C: Connector> CatalogWriter<C> {
    pub(crate) fn new(ctx: Arc<CatalogContext<C>>) -> Self {
        Self { ctx }
    }

    /// Insert a new record. Fails with `DuplicateKey` if the uid exists,
    /// leaving the stored record untouched.
    pub async fn create(&self, mut record: CatalogRecord) -> Result<(), StorageError> {
        record.normalize_times();
        schema::check(&record)?;

        let mut doc = self.ctx.schema.serialize(&record);
        doc.insert(REVISION_FIELD, 0_i64);

        let sent = &doc;
        self.ctx
            .with_retry("insert", |store, replay| async move {
                match store.insert(sent.clone()).await {
                    // The earlier attempt landed but its reply was lost.
                    Err(StorageError::DuplicateKey { uid }) if replay => {
                        let stored = store.find_one(&uid).await?;
                        match stored {
                            Some(stored) if same_document(&stored, sent) => Ok(()),
                            _ => Err(StorageError::DuplicateKey { uid }),
                        }
                    }
                    other => other,
                }
            })
            .await?;
        info!(uid = %record.uid, platform = %record.platform_name, "Record created");
        Ok(())
    }

    /// Validate a raw document and insert it.
    pub async fn create_from_document(
        &self,
        raw: &Document,
    ) -> Result<CatalogRecord, StorageError> {
        let record = self.ctx.schema.validate(raw)?;
        self.create(record.clone()).await?;
        Ok(record)
    }

    /// Apply a patch to a record and return the resulting state.
    ///
    /// A patch that changes nothing performs no write.
    pub async fn update(
        &self,
        uid: &str,
        patch: &RecordPatch,
    ) -> Result<CatalogRecord, StorageError> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let raw = self.ctx.find_raw(uid).await?;
            let current_revision = schema::revision(&raw);
            let current = self.ctx.decode(&raw)?;

            let mut updated = current.clone();
            patch.apply(&mut updated);
            if updated == current {
                debug!(uid = %uid, "Patch is a no-op, skipping write");
                return Ok(current);
            }
            schema::check(&updated)?;

            let mut doc = self.ctx.schema.serialize(&updated);
            doc.insert(REVISION_FIELD, current_revision + 1);

            // A replayed replace that already landed fails the revision
            // check; the next round then sees a no-op patch.
            let sent = &doc;
            let replaced = self
                .ctx
                .with_retry("replace", |store, _| async move {
                    store.replace(uid, current_revision, sent.clone()).await
                })
                .await?;
            if replaced {
                info!(uid = %uid, revision = current_revision + 1, "Record updated");
                return Ok(updated);
            }
            debug!(uid = %uid, attempt, "Concurrent modification, retrying update");
        }

        warn!(uid = %uid, attempts = MAX_UPDATE_ATTEMPTS, "Update kept losing races");
        Err(StorageError::Conflict {
            uid: uid.to_string(),
        })
    }

    /// Delete a record together with its embedded tags, parameters and boundary.
    pub async fn delete(&self, uid: &str) -> Result<(), StorageError> {
        let deleted = self
            .ctx
            .with_retry("delete", |store, replay| async move {
                // Nothing left to delete on a replay means the earlier attempt did it.
                Ok(store.delete(uid).await? || replay)
            })
            .await?;
        if !deleted {
            return Err(StorageError::NotFound {
                uid: uid.to_string(),
            });
        }
        info!(uid = %uid, "Record deleted");
        Ok(())
    }
}

// =============================================================================
// Admin
// =============================================================================

/// Connection lifecycle operations.
pub struct StorageAdmin<C: Connector> {
    ctx: Arc<CatalogContext<C>>,
}

impl<C: Connector> Clone for StorageAdmin<C> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<C: Connector> std::fmt::Debug for StorageAdmin<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAdmin").finish_non_exhaustive()
    }
}

impl<C: Connector> StorageAdmin<C> {
    pub(crate) fn new(ctx: Arc<CatalogContext<C>>) -> Self {
        Self { ctx }
    }

    /// Lightweight liveness probe. Never fails.
    pub async fn health_check(&self) -> bool {
        self.ctx.manager.health_check().await
    }

    /// Tear down the current connection and establish a new one.
    pub async fn reconnect(&self) -> Result<(), StorageError> {
        self.ctx.manager.reconnect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.ctx.manager.is_connected().await
    }

    /// Release the connection. A later operation reconnects lazily.
    pub async fn close(&self) {
        self.ctx.manager.close().await;
    }
}
