//! In-process document store.
//!
//! Evaluates compiled predicates directly with the same matching and
//! sorting rules the MongoDB backend relies on. The connector carries an
//! availability switch so callers can simulate an unreachable store.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bson::{Bson, Document};

use super::{Connector, DocumentStore};
use crate::storage::StorageError;
use crate::storage::filter::{Predicate, compare_values, lookup};
use crate::storage::pagination::{PagePlan, SortDirection};
use crate::storage::schema::revision;

#[derive(Debug, Default)]
struct MemoryState {
    docs: RwLock<BTreeMap<String, Document>>,
    unavailable: AtomicBool,
    connects: AtomicU32,
}

impl MemoryState {
    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Document>>, StorageError> {
        self.docs
            .read()
            .map_err(|_| StorageError::Internal("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Document>>, StorageError> {
        self.docs
            .write()
            .map_err(|_| StorageError::Internal("memory store lock poisoned".to_string()))
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(StorageError::Connection {
                attempts: 1,
                message: "memory store unavailable".to_string(),
            });
        }
        Ok(())
    }
}

/// Connector for the in-process store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<MemoryState>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle reachability. While unavailable, connects and every store
    /// operation fail with a connection error.
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, AtomicOrdering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u32 {
        self.state.connects.load(AtomicOrdering::SeqCst)
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.state.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a raw document as-is, bypassing validation.
    pub fn seed(&self, doc: Document) -> Result<(), StorageError> {
        let uid = document_uid(&doc)?;
        self.state.write()?.insert(uid, doc);
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Store = MemoryStore;

    async fn connect(&self) -> Result<MemoryStore, StorageError> {
        self.state.check_available()?;
        self.state.connects.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(MemoryStore {
            state: Arc::clone(&self.state),
        })
    }
}

/// Handle to the in-process store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<MemoryState>,
}

fn document_uid(doc: &Document) -> Result<String, StorageError> {
    doc.get_str("uid")
        .map(str::to_string)
        .map_err(|_| StorageError::Internal("document has no string uid".to_string()))
}

/// Rank of a value's type in the store's sort order. Missing sorts with null.
fn type_rank(value: Option<&Bson>) -> u8 {
    match value {
        None | Some(Bson::Null) | Some(Bson::Undefined) => 0,
        Some(Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_)) => 1,
        Some(Bson::String(_) | Bson::Symbol(_)) => 2,
        Some(Bson::Document(_)) => 3,
        Some(Bson::Array(_)) => 4,
        Some(Bson::Binary(_)) => 5,
        Some(Bson::ObjectId(_)) => 6,
        Some(Bson::Boolean(_)) => 7,
        Some(Bson::DateTime(_)) => 8,
        Some(Bson::Timestamp(_)) => 9,
        Some(Bson::RegularExpression(_)) => 10,
        Some(_) => 11,
    }
}

fn sort_value_cmp(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    type_rank(a).cmp(&type_rank(b)).then_with(|| match (a, b) {
        (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    })
}

fn plan_order(a: &Document, b: &Document, plan: &PagePlan) -> Ordering {
    let primary = sort_value_cmp(lookup(a, &plan.sort_path), lookup(b, &plan.sort_path));
    let primary = match plan.direction {
        SortDirection::Asc => primary,
        SortDirection::Desc => primary.reverse(),
    };
    primary.then_with(|| sort_value_cmp(a.get("uid"), b.get("uid")))
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<(), StorageError> {
        self.state.check_available()
    }

    async fn insert(&self, doc: Document) -> Result<(), StorageError> {
        self.state.check_available()?;
        let uid = document_uid(&doc)?;
        let mut docs = self.state.write()?;
        if docs.contains_key(&uid) {
            return Err(StorageError::DuplicateKey { uid });
        }
        docs.insert(uid, doc);
        Ok(())
    }

    async fn find_one(&self, uid: &str) -> Result<Option<Document>, StorageError> {
        self.state.check_available()?;
        Ok(self.state.read()?.get(uid).cloned())
    }

    async fn find(
        &self,
        predicate: &Predicate,
        plan: &PagePlan,
    ) -> Result<Vec<Document>, StorageError> {
        self.state.check_available()?;
        let docs = self.state.read()?;
        let mut matched: Vec<&Document> = docs.values().filter(|d| predicate.matches(d)).collect();
        matched.sort_by(|a, b| plan_order(a, b, plan));
        Ok(matched
            .into_iter()
            .skip(usize::try_from(plan.offset).unwrap_or(usize::MAX))
            .take(plan.limit as usize)
            .cloned()
            .collect())
    }

    async fn count(&self, predicate: &Predicate) -> Result<u64, StorageError> {
        self.state.check_available()?;
        let docs = self.state.read()?;
        Ok(docs.values().filter(|d| predicate.matches(d)).count() as u64)
    }

    async fn replace(
        &self,
        uid: &str,
        expected_revision: i64,
        doc: Document,
    ) -> Result<bool, StorageError> {
        self.state.check_available()?;
        let mut docs = self.state.write()?;
        match docs.get_mut(uid) {
            Some(existing) if revision(existing) == expected_revision => {
                *existing = doc;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, uid: &str) -> Result<bool, StorageError> {
        self.state.check_available()?;
        Ok(self.state.write()?.remove(uid).is_some())
    }

    async fn distinct(&self, path: &str, predicate: &Predicate) -> Result<Vec<Bson>, StorageError> {
        self.state.check_available()?;
        let docs = self.state.read()?;
        let mut values: Vec<Bson> = Vec::new();
        for doc in docs.values().filter(|d| predicate.matches(d)) {
            let found = match lookup(doc, path) {
                None => continue,
                Some(Bson::Array(items)) => items.clone(),
                Some(v) => vec![v.clone()],
            };
            for v in found {
                if !values.contains(&v) {
                    values.push(v);
                }
            }
        }
        Ok(values)
    }
}
