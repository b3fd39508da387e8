//! # Metalstore Storage
//!
//! Backing-store seams for metalstore.
//!
//! This crate provides the lowest-level abstractions metalstore runs on:
//! a keyed JSON **document store** and a capped **log stream** with consumer
//! groups. Both are dumb: they do not know about entities, timestamps, pools
//! or tasks.
//!
//! ## Design Principles
//!
//! - Per-document atomic operations only, no multi-key transactions
//! - Destructive operations hand back the value they removed
//! - Conditional writes are expressed as field-equality [`Guard`]s
//! - Must be `Send + Sync` and safe to share across tokio tasks
//!
//! ## Available Backends
//!
//! - [`InMemoryDocumentStore`] - Document store for tests and embedded use
//! - [`InMemoryLogStream`] - Capped log stream with consumer groups
//!
//! ## Example
//!
//! ```rust
//! use metalstore_storage::{InMemoryLogStream, LogStream};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let log = InMemoryLogStream::new();
//! log.ensure_group("workers").await.unwrap();
//! let id = log.append(b"hello".to_vec(), 100).await.unwrap();
//!
//! let entry = log.read_next("workers", "w-1").await.unwrap();
//! assert_eq!(entry.id, id);
//! assert!(log.ack("workers", id).await.unwrap());
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod document;
mod error;
mod log;
mod memory;
mod memory_log;

pub use backend::DocumentStore;
pub use document::{Document, Guard, Key, OnConflict, Predicate};
pub use error::{StorageError, StorageResult};
pub use log::{EntryId, LogEntry, LogStream, PendingEntry};
pub use memory::InMemoryDocumentStore;
pub use memory_log::{InMemoryLogStream, DEFAULT_MAX_LEN};
