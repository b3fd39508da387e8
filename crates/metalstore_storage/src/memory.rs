//! In-memory document store.

use crate::backend::DocumentStore;
use crate::document::{Document, Guard, Key, OnConflict, Predicate};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

type Collection = BTreeMap<Key, Document>;

/// An in-memory document store.
///
/// This store keeps every collection in memory and is suitable for:
/// - Unit and integration tests
/// - Embedded deployments that do not need persistence
///
/// # Thread Safety
///
/// Each operation takes the store lock once, so single-document operations
/// are atomic. `delete_random` takes it twice (sample, then
/// delete), so a racing caller can take the sampled key first.
///
/// # Example
///
/// ```rust
/// use metalstore_storage::{DocumentStore, InMemoryDocumentStore, Key};
/// use serde_json::json;
///
/// # tokio_test_block(async {
/// let store = InMemoryDocumentStore::new();
/// store.ensure_collection("machines").await.unwrap();
/// store.insert("machines", Key::from("m-1"), json!({"id": "m-1"})).await.unwrap();
/// assert!(store.get("machines", &Key::from("m-1")).await.unwrap().is_some());
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Collection>>,
    closed: AtomicBool,
}

impl InMemoryDocumentStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the store. Every later operation fails with `Closed`.
    ///
    /// Useful for exercising backend-failure paths in tests.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn with_collection<R>(
        &self,
        collection: &str,
        f: impl FnOnce(&Collection) -> R,
    ) -> StorageResult<R> {
        self.check_open()?;
        let collections = self.collections.read();
        let docs = collections
            .get(collection)
            .ok_or_else(|| StorageError::CollectionNotFound(collection.to_string()))?;
        Ok(f(docs))
    }

    fn with_collection_mut<R>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut Collection) -> StorageResult<R>,
    ) -> StorageResult<R> {
        self.check_open()?;
        let mut collections = self.collections.write();
        let docs = collections
            .get_mut(collection)
            .ok_or_else(|| StorageError::CollectionNotFound(collection.to_string()))?;
        f(docs)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn ensure_collection(&self, collection: &str) -> StorageResult<()> {
        self.check_open()?;
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> StorageResult<bool> {
        self.check_open()?;
        Ok(self.collections.write().remove(collection).is_some())
    }

    async fn collections(&self) -> StorageResult<Vec<String>> {
        self.check_open()?;
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn get(&self, collection: &str, key: &Key) -> StorageResult<Option<Document>> {
        self.with_collection(collection, |docs| docs.get(key).cloned())
    }

    async fn insert(&self, collection: &str, key: Key, doc: Document) -> StorageResult<()> {
        self.with_collection_mut(collection, |docs| {
            if docs.contains_key(&key) {
                return Err(StorageError::already_exists(collection, &key));
            }
            docs.insert(key, doc);
            Ok(())
        })
    }

    async fn insert_many(
        &self,
        collection: &str,
        batch: Vec<(Key, Document)>,
        on_conflict: OnConflict,
    ) -> StorageResult<usize> {
        self.with_collection_mut(collection, |docs| {
            if on_conflict == OnConflict::Error {
                if let Some((key, _)) = batch.iter().find(|(key, _)| docs.contains_key(key)) {
                    return Err(StorageError::already_exists(collection, key));
                }
            }
            let written = batch.len();
            docs.extend(batch);
            Ok(written)
        })
    }

    async fn upsert(
        &self,
        collection: &str,
        key: Key,
        doc: Document,
    ) -> StorageResult<Option<Document>> {
        self.with_collection_mut(collection, |docs| Ok(docs.insert(key, doc)))
    }

    async fn replace_if(
        &self,
        collection: &str,
        key: &Key,
        doc: Document,
        guard: &Guard,
    ) -> StorageResult<Document> {
        self.with_collection_mut(collection, |docs| {
            let current = docs
                .get_mut(key)
                .ok_or_else(|| StorageError::not_found(collection, key))?;
            if !guard.matches(current) {
                return Err(StorageError::GuardFailed {
                    collection: collection.to_string(),
                    key: key.to_string(),
                    field: guard.field.clone(),
                });
            }
            Ok(std::mem::replace(current, doc))
        })
    }

    async fn delete(&self, collection: &str, key: &Key) -> StorageResult<Option<Document>> {
        self.with_collection_mut(collection, |docs| Ok(docs.remove(key)))
    }

    async fn delete_random(&self, collection: &str) -> StorageResult<Option<(Key, Document)>> {
        let sampled = self.with_collection(collection, |docs| {
            let mut rng = rand::thread_rng();
            match (docs.keys().next(), docs.keys().next_back()) {
                (None, _) | (_, None) => None,
                // Integer keys: O(log n) seek from a random point. Keys after
                // a gap are picked more often.
                (Some(Key::Int(lo)), Some(Key::Int(hi))) => {
                    let from = Key::Int(rng.gen_range(*lo..=*hi));
                    docs.range(from..).next().map(|(key, _)| key.clone())
                }
                // Mixed or text keys: O(n) walk.
                _ => {
                    let index = rng.gen_range(0..docs.len());
                    docs.keys().nth(index).cloned()
                }
            }
        })?;

        let Some(key) = sampled else {
            return Ok(None);
        };

        self.with_collection_mut(collection, |docs| {
            Ok(docs.remove(&key).map(|doc| (key, doc)))
        })
    }

    async fn query(
        &self,
        collection: &str,
        predicate: Option<Predicate>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<(Key, Document)>> {
        self.with_collection(collection, |docs| {
            let matching = docs
                .iter()
                .filter(|(_, doc)| predicate.as_ref().map_or(true, |p| p(doc)))
                .map(|(key, doc)| (key.clone(), doc.clone()));
            match limit {
                Some(limit) => matching.take(limit).collect(),
                None => matching.collect(),
            }
        })
    }

    async fn count(&self, collection: &str) -> StorageResult<usize> {
        self.with_collection(collection, BTreeMap::len)
    }
}
