//! # Metalstore Testkit
//!
//! Test utilities for metalstore.
//!
//! This crate provides:
//! - In-memory fixtures, sample entities and instrumented store wrappers
//! - Property-based test generators using proptest
//! - Concurrency stress helpers for entities, pools and queues
//!
//! The crate's `tests/` directory holds the cross-crate integration tests.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use metalstore_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_env() {
//!     let env = TestEnv::new();
//!     let machines = env.entity_store::<Machine>("machines").await;
//!     // ... test operations
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
