//! Test fixtures and in-memory wiring.
//!
//! Provides sample entities, a ready-to-use in-memory environment and a
//! few backend wrappers for observing what the core asks of a store.

use async_trait::async_trait;
use metalstore_core::{
    ActionHandler, CoreError, Entity, EntityId, EntityStore, IntegerPool, Meta, OpContext,
    PoolConfig, Step,
};
use metalstore_storage::{
    Document, DocumentStore, Guard, InMemoryDocumentStore, InMemoryLogStream, Key, LogStream,
    OnConflict, Predicate, StorageResult,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// A bare-metal machine record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    /// Identifier and timestamps.
    #[serde(flatten)]
    pub meta: Meta,
    /// Hostname.
    pub hostname: String,
    /// Rack the machine sits in.
    pub rack: String,
    /// Lifecycle state.
    pub state: String,
}

impl Machine {
    /// Creates a ready machine.
    pub fn new(id: &str, rack: &str) -> Self {
        Self {
            meta: Meta::with_id(id),
            hostname: format!("{id}.{rack}"),
            rack: rack.to_string(),
            state: "ready".to_string(),
        }
    }
}

impl Entity for Machine {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

/// An IP address allocated from an external IPAM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpAllocation {
    /// Identifier and timestamps.
    #[serde(flatten)]
    pub meta: Meta,
    /// Allocated address.
    pub address: String,
    /// Prefix the address came from.
    pub prefix: String,
}

impl IpAllocation {
    /// Creates an allocation record.
    pub fn new(id: &str, address: &str) -> Self {
        Self {
            meta: Meta::with_id(id),
            address: address.to_string(),
            prefix: "10.0.0.0/8".to_string(),
        }
    }
}

impl Entity for IpAllocation {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

/// In-memory backends plus a background operation context.
pub struct TestEnv {
    /// Document store.
    pub docs: Arc<InMemoryDocumentStore>,
    /// Log stream.
    pub log: Arc<InMemoryLogStream>,
    /// Context that is never cancelled.
    pub ctx: OpContext,
}

impl TestEnv {
    /// Creates empty backends.
    pub fn new() -> Self {
        init_test_tracing();
        Self {
            docs: Arc::new(InMemoryDocumentStore::new()),
            log: Arc::new(InMemoryLogStream::new()),
            ctx: OpContext::background(),
        }
    }

    /// The document store as a trait object.
    pub fn backend(&self) -> Arc<dyn DocumentStore> {
        self.docs.clone()
    }

    /// The log stream as a trait object.
    pub fn stream(&self) -> Arc<dyn LogStream> {
        self.log.clone()
    }

    /// Opens an entity store over `collection`.
    pub async fn entity_store<T: Entity>(&self, collection: &str) -> EntityStore<T> {
        EntityStore::open(self.backend(), collection, &self.ctx)
            .await
            .expect("Failed to open entity store")
    }

    /// Opens and seeds an integer pool.
    pub async fn pool(&self, name: &str, min: u32, max: u32) -> IntegerPool {
        IntegerPool::open(self.backend(), PoolConfig::new(name, min, max), &self.ctx)
            .await
            .expect("Failed to open integer pool")
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the `release` action: deletes the step's target allocation.
///
/// Deleting an allocation that is already gone succeeds, so the action is
/// safe to run again after a redelivery.
pub fn release_allocation(
    store: EntityStore<IpAllocation>,
) -> impl ActionHandler + Clone + 'static {
    move |step: Step| {
        let store = store.clone();
        async move {
            store
                .delete_by_id(&OpContext::background(), &step.target_id)
                .await
        }
    }
}

/// Builds an action that records every step it sees and succeeds.
pub fn recording_action(
    sink: Arc<parking_lot::Mutex<Vec<Step>>>,
) -> impl ActionHandler + Clone + 'static {
    move |step: Step| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().push(step);
            Ok::<_, CoreError>(())
        }
    }
}

/// A document store wrapper that counts calls per operation.
pub struct CountingDocumentStore {
    inner: Arc<dyn DocumentStore>,
    insert_many_calls: AtomicUsize,
    replace_if_calls: AtomicUsize,
    delete_random_calls: AtomicUsize,
}

impl CountingDocumentStore {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner,
            insert_many_calls: AtomicUsize::new(0),
            replace_if_calls: AtomicUsize::new(0),
            delete_random_calls: AtomicUsize::new(0),
        }
    }

    /// Number of bulk inserts so far.
    pub fn insert_many_calls(&self) -> usize {
        self.insert_many_calls.load(Ordering::SeqCst)
    }

    /// Number of guarded replaces so far.
    pub fn replace_if_calls(&self) -> usize {
        self.replace_if_calls.load(Ordering::SeqCst)
    }

    /// Number of random deletes so far.
    pub fn delete_random_calls(&self) -> usize {
        self.delete_random_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for CountingDocumentStore {
    async fn ensure_collection(&self, collection: &str) -> StorageResult<()> {
        self.inner.ensure_collection(collection).await
    }

    async fn drop_collection(&self, collection: &str) -> StorageResult<bool> {
        self.inner.drop_collection(collection).await
    }

    async fn collections(&self) -> StorageResult<Vec<String>> {
        self.inner.collections().await
    }

    async fn get(&self, collection: &str, key: &Key) -> StorageResult<Option<Document>> {
        self.inner.get(collection, key).await
    }

    async fn insert(&self, collection: &str, key: Key, doc: Document) -> StorageResult<()> {
        self.inner.insert(collection, key, doc).await
    }

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<(Key, Document)>,
        on_conflict: OnConflict,
    ) -> StorageResult<usize> {
        self.insert_many_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.insert_many(collection, docs, on_conflict).await
    }

    async fn upsert(
        &self,
        collection: &str,
        key: Key,
        doc: Document,
    ) -> StorageResult<Option<Document>> {
        self.inner.upsert(collection, key, doc).await
    }

    async fn replace_if(
        &self,
        collection: &str,
        key: &Key,
        doc: Document,
        guard: &Guard,
    ) -> StorageResult<Document> {
        self.replace_if_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.replace_if(collection, key, doc, guard).await
    }

    async fn delete(&self, collection: &str, key: &Key) -> StorageResult<Option<Document>> {
        self.inner.delete(collection, key).await
    }

    async fn delete_random(&self, collection: &str) -> StorageResult<Option<(Key, Document)>> {
        self.delete_random_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_random(collection).await
    }

    async fn query(
        &self,
        collection: &str,
        predicate: Option<Predicate>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<(Key, Document)>> {
        self.inner.query(collection, predicate, limit).await
    }

    async fn count(&self, collection: &str) -> StorageResult<usize> {
        self.inner.count(collection).await
    }
}

/// A document store that answers the first `stale_reads` point reads of
/// one collection with "not found", as a lagging replica would.
pub struct StaleReadDocumentStore {
    inner: Arc<dyn DocumentStore>,
    collection: String,
    stale_reads: AtomicUsize,
}

impl StaleReadDocumentStore {
    /// Wraps `inner`, hiding `collection` from the next `stale_reads` gets.
    pub fn new(
        inner: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        stale_reads: usize,
    ) -> Self {
        Self {
            inner,
            collection: collection.into(),
            stale_reads: AtomicUsize::new(stale_reads),
        }
    }

    /// Stale reads not yet served.
    pub fn remaining(&self) -> usize {
        self.stale_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for StaleReadDocumentStore {
    async fn ensure_collection(&self, collection: &str) -> StorageResult<()> {
        self.inner.ensure_collection(collection).await
    }

    async fn drop_collection(&self, collection: &str) -> StorageResult<bool> {
        self.inner.drop_collection(collection).await
    }

    async fn collections(&self) -> StorageResult<Vec<String>> {
        self.inner.collections().await
    }

    async fn get(&self, collection: &str, key: &Key) -> StorageResult<Option<Document>> {
        if collection == self.collection
            && self
                .stale_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Ok(None);
        }
        self.inner.get(collection, key).await
    }

    async fn insert(&self, collection: &str, key: Key, doc: Document) -> StorageResult<()> {
        self.inner.insert(collection, key, doc).await
    }

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<(Key, Document)>,
        on_conflict: OnConflict,
    ) -> StorageResult<usize> {
        self.inner.insert_many(collection, docs, on_conflict).await
    }

    async fn upsert(
        &self,
        collection: &str,
        key: Key,
        doc: Document,
    ) -> StorageResult<Option<Document>> {
        self.inner.upsert(collection, key, doc).await
    }

    async fn replace_if(
        &self,
        collection: &str,
        key: &Key,
        doc: Document,
        guard: &Guard,
    ) -> StorageResult<Document> {
        self.inner.replace_if(collection, key, doc, guard).await
    }

    async fn delete(&self, collection: &str, key: &Key) -> StorageResult<Option<Document>> {
        self.inner.delete(collection, key).await
    }

    async fn delete_random(&self, collection: &str) -> StorageResult<Option<(Key, Document)>> {
        self.inner.delete_random(collection).await
    }

    async fn query(
        &self,
        collection: &str,
        predicate: Option<Predicate>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<(Key, Document)>> {
        self.inner.query(collection, predicate, limit).await
    }

    async fn count(&self, collection: &str) -> StorageResult<usize> {
        self.inner.count(collection).await
    }
}

/// A document store whose `delete_random` always loses the race: it
/// reports nothing deleted while the collection still has documents.
pub struct ContendedDocumentStore {
    inner: Arc<dyn DocumentStore>,
}

impl ContendedDocumentStore {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl DocumentStore for ContendedDocumentStore {
    async fn ensure_collection(&self, collection: &str) -> StorageResult<()> {
        self.inner.ensure_collection(collection).await
    }

    async fn drop_collection(&self, collection: &str) -> StorageResult<bool> {
        self.inner.drop_collection(collection).await
    }

    async fn collections(&self) -> StorageResult<Vec<String>> {
        self.inner.collections().await
    }

    async fn get(&self, collection: &str, key: &Key) -> StorageResult<Option<Document>> {
        self.inner.get(collection, key).await
    }

    async fn insert(&self, collection: &str, key: Key, doc: Document) -> StorageResult<()> {
        self.inner.insert(collection, key, doc).await
    }

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<(Key, Document)>,
        on_conflict: OnConflict,
    ) -> StorageResult<usize> {
        self.inner.insert_many(collection, docs, on_conflict).await
    }

    async fn upsert(
        &self,
        collection: &str,
        key: Key,
        doc: Document,
    ) -> StorageResult<Option<Document>> {
        self.inner.upsert(collection, key, doc).await
    }

    async fn replace_if(
        &self,
        collection: &str,
        key: &Key,
        doc: Document,
        guard: &Guard,
    ) -> StorageResult<Document> {
        self.inner.replace_if(collection, key, doc, guard).await
    }

    async fn delete(&self, collection: &str, key: &Key) -> StorageResult<Option<Document>> {
        self.inner.delete(collection, key).await
    }

    async fn delete_random(&self, _collection: &str) -> StorageResult<Option<(Key, Document)>> {
        Ok(None)
    }

    async fn query(
        &self,
        collection: &str,
        predicate: Option<Predicate>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<(Key, Document)>> {
        self.inner.query(collection, predicate, limit).await
    }

    async fn count(&self, collection: &str) -> StorageResult<usize> {
        self.inner.count(collection).await
    }
}

/// Installs a fmt subscriber for tests, once per process.
///
/// The filter comes from `RUST_LOG` and defaults to `warn`.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Polls `done` until it holds, failing the test after `timeout`.
pub async fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) {
    tokio::time::timeout(timeout, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Condition not reached in time");
}

/// Like [`wait_until`] for conditions that need to await.
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut done: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !done().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Condition not reached in time");
}

/// Builds a fresh id unlikely to collide across tests.
pub fn unique_id(prefix: &str) -> EntityId {
    EntityId::new(format!("{prefix}-{}", EntityId::generate()))
}
