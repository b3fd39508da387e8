//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur inside a backing store.
///
/// These are low-level errors. `metalstore_core` maps them onto its own
/// error taxonomy before they reach callers.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No document exists under the given key.
    #[error("document {key} not found in collection {collection}")]
    NotFound {
        /// Collection that was searched.
        collection: String,
        /// Key that was not found.
        key: String,
    },

    /// An insert collided with an existing document.
    #[error("document {key} already exists in collection {collection}")]
    AlreadyExists {
        /// Collection written to.
        collection: String,
        /// Key that collided.
        key: String,
    },

    /// A guarded replace found a field value different from the expected one.
    #[error("guard on field {field} failed for document {key} in collection {collection}")]
    GuardFailed {
        /// Collection written to.
        collection: String,
        /// Key of the guarded document.
        key: String,
        /// Field the guard compared.
        field: String,
    },

    /// The collection has not been created.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// The consumer group has not been created on the log stream.
    #[error("consumer group not found: {0}")]
    GroupNotFound(String),

    /// A document or payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Backend-specific failure (network, I/O, timeout).
    #[error("backend error: {0}")]
    Backend(String),

    /// The backend has been closed.
    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    /// Creates a not-found error.
    pub fn not_found(collection: impl Into<String>, key: impl ToString) -> Self {
        Self::NotFound {
            collection: collection.into(),
            key: key.to_string(),
        }
    }

    /// Creates an already-exists error.
    pub fn already_exists(collection: impl Into<String>, key: impl ToString) -> Self {
        Self::AlreadyExists {
            collection: collection.into(),
            key: key.to_string(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
