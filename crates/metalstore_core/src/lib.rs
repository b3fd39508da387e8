//! # Metalstore Core
//!
//! Persistence backbone of a bare-metal control plane.
//!
//! This crate provides:
//! - [`EntityStore`] - typed CRUD with optimistic concurrency on the
//!   `changed` timestamp
//! - [`IntegerPool`] - lock-free allocation of unique integers from a
//!   bounded range
//! - [`TaskQueue`] - durable, ordered, at-least-once execution of deferred
//!   actions through one background worker
//! - [`MigrationRunner`] - forward-only, recorded data migrations
//!
//! Every operation takes an [`OpContext`] carrying a cancellation token and
//! an optional deadline. Backends are the [`DocumentStore`] and
//! [`LogStream`] seams from `metalstore_storage`.
//!
//! ## Example
//!
//! ```rust
//! use metalstore_core::{IntegerPool, OpContext, PoolConfig};
//! use metalstore_storage::InMemoryDocumentStore;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let ctx = OpContext::background();
//! let backend = Arc::new(InMemoryDocumentStore::new());
//! let pool = IntegerPool::open(backend, PoolConfig::new("vrf", 1, 4096), &ctx)
//!     .await
//!     .unwrap();
//!
//! let vrf = pool.acquire_random(&ctx).await.unwrap();
//! pool.release(&ctx, vrf).await.unwrap();
//! # });
//! ```
//!
//! [`DocumentStore`]: metalstore_storage::DocumentStore
//! [`LogStream`]: metalstore_storage::LogStream

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod context;
mod entity;
mod error;
mod filter;
pub mod migration;
mod pool;
pub mod queue;

pub use clock::Clock;
pub use config::{PoolConfig, QueueConfig, RetryPolicy};
pub use context::OpContext;
pub use entity::{
    Entity, EntityId, EntityStore, Meta, CHANGED_BY_ANOTHER, CHANGED_FIELD, CREATED_FIELD,
    ID_FIELD,
};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use filter::Filter;
pub use migration::{Migration, MigrationContext, MigrationRunner};
pub use pool::{IntegerPool, PoolInfo};
pub use queue::{
    ActionHandler, ActionKind, ActionRegistry, QueueStatsSnapshot, Step, Task, TaskFailure,
    TaskId, TaskQueue,
};

pub use tokio_util::sync::CancellationToken;
