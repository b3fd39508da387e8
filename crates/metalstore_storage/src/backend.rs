//! Document store trait definition.

use crate::document::{Document, Guard, Key, OnConflict, Predicate};
use crate::error::StorageResult;
use async_trait::async_trait;

/// A backing document store.
///
/// Document stores are **dumb collections of keyed JSON documents**. They
/// provide per-document atomic operations and nothing more: no multi-key
/// transactions, no cross-collection atomicity. Optimistic concurrency,
/// timestamps and identifier generation live in `metalstore_core`.
///
/// # Invariants
///
/// - Every single-document operation is atomic with respect to every other
///   operation on the same key
/// - `replace_if` evaluates its guard and writes in one atomic step
/// - `delete` and `delete_random` hand back the document they removed, so
///   callers never need a separate read that could race the delete
/// - Implementations must be `Send + Sync`; callers share one store across
///   tasks without external locking
///
/// # Implementors
///
/// - [`super::InMemoryDocumentStore`] - for tests and embedded use
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates the collection if it does not exist. Idempotent.
    async fn ensure_collection(&self, collection: &str) -> StorageResult<()>;

    /// Drops the collection and every document in it.
    ///
    /// Returns `false` if the collection did not exist.
    async fn drop_collection(&self, collection: &str) -> StorageResult<bool>;

    /// Returns the names of all collections.
    async fn collections(&self) -> StorageResult<Vec<String>>;

    /// Reads a document by key.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` if the collection does not exist.
    async fn get(&self, collection: &str, key: &Key) -> StorageResult<Option<Document>>;

    /// Inserts a new document.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a document is already stored under `key`.
    async fn insert(&self, collection: &str, key: Key, doc: Document) -> StorageResult<()>;

    /// Inserts a batch of documents in one call.
    ///
    /// With [`OnConflict::Error`] the batch is rejected as a whole if any key
    /// exists. Returns the number of documents written.
    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<(Key, Document)>,
        on_conflict: OnConflict,
    ) -> StorageResult<usize>;

    /// Inserts or fully replaces a document.
    ///
    /// Returns the previous document, if any.
    async fn upsert(&self, collection: &str, key: Key, doc: Document)
        -> StorageResult<Option<Document>>;

    /// Replaces a document only if `guard` holds for the stored version.
    ///
    /// Returns the replaced document.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no document is stored under `key`
    /// - `GuardFailed` if the stored document does not satisfy `guard`
    async fn replace_if(
        &self,
        collection: &str,
        key: &Key,
        doc: Document,
        guard: &Guard,
    ) -> StorageResult<Document>;

    /// Deletes a document and returns its previous value.
    ///
    /// Deleting an absent key is not an error; it returns `None`.
    async fn delete(&self, collection: &str, key: &Key) -> StorageResult<Option<Document>>;

    /// Samples one document at random and deletes it, returning the deleted
    /// key and value.
    ///
    /// Sampling and deletion are two steps, so a concurrent caller may take
    /// the sampled key first. In that case, and when the collection is empty,
    /// the call returns `None`. Callers tell the two apart with [`count`].
    ///
    /// [`count`]: DocumentStore::count
    async fn delete_random(&self, collection: &str) -> StorageResult<Option<(Key, Document)>>;

    /// Returns documents matching `predicate` in key order, stopping after
    /// `limit` matches when a limit is given.
    async fn query(
        &self,
        collection: &str,
        predicate: Option<Predicate>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<(Key, Document)>>;

    /// Returns the number of documents in the collection.
    async fn count(&self, collection: &str) -> StorageResult<usize>;
}
