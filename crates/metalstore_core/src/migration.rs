//! Schema migration support.
//!
//! This module provides versioned, forward-only data migrations for the
//! collections metalstore manages.
//!
//! ## Design Philosophy
//!
//! Migrations in metalstore are:
//! - **Explicit**: every migration is registered on a [`MigrationRunner`]
//!   value; there is no process-wide registration
//! - **Forward-only**: the runner refuses to target a version older than
//!   the one already applied
//! - **Recorded**: each applied version is one document in the
//!   `migrations` collection, written only after the migration succeeded
//!
//! ## Usage
//!
//! ```ignore
//! use metalstore_core::migration::{Migration, MigrationContext, MigrationRunner};
//!
//! struct AddRackField;
//!
//! #[async_trait]
//! impl Migration for AddRackField {
//!     fn version(&self) -> u64 { 1 }
//!     fn name(&self) -> &str { "add_rack_field" }
//!     async fn up(&self, ctx: &MigrationContext) -> CoreResult<()> {
//!         for (key, mut doc) in ctx.documents("machines").await? {
//!             doc["rack"] = "unassigned".into();
//!             ctx.put("machines", key, doc).await?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut runner = MigrationRunner::new(backend);
//! runner.register(Box::new(AddRackField))?;
//! runner.run(&ctx, None).await?;
//! ```

use crate::clock::Clock;
use crate::context::OpContext;
use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metalstore_storage::{Document, DocumentStore, Key};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Collection holding one document per applied migration.
pub const MIGRATIONS_COLLECTION: &str = "migrations";

/// Version number for migrations.
pub type MigrationVersion = u64;

/// Information about a registered migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Version number (unique, sequential).
    pub version: MigrationVersion,
    /// Human-readable name.
    pub name: String,
    /// Description of what this migration does.
    pub description: Option<String>,
}

/// Result of running a single migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationResult {
    /// The migration version that was run.
    pub version: MigrationVersion,
    /// The migration name.
    pub name: String,
    /// Whether the migration succeeded.
    pub success: bool,
    /// Error message if migration failed.
    pub error: Option<String>,
}

/// Result of a [`MigrationRunner::run`] that applied everything it tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRunResult {
    /// Migrations that were run, in order.
    pub migrations: Vec<MigrationResult>,
    /// Version before the run.
    pub initial_version: MigrationVersion,
    /// Version after the run.
    pub final_version: MigrationVersion,
}

impl MigrationRunResult {
    /// Number of migrations applied.
    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.migrations.iter().filter(|m| m.success).count()
    }
}

/// Stored record of an applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    /// Version number.
    pub version: MigrationVersion,
    /// Migration name.
    pub name: String,
    /// When the migration was applied.
    pub applied_at: DateTime<Utc>,
}

/// What a migration can touch while it runs.
pub struct MigrationContext {
    backend: Arc<dyn DocumentStore>,
    op: OpContext,
    /// Version applied before this migration.
    pub current_version: MigrationVersion,
}

impl MigrationContext {
    /// The underlying document store.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn DocumentStore> {
        &self.backend
    }

    /// The operation context of the run.
    #[must_use]
    pub fn op(&self) -> &OpContext {
        &self.op
    }

    /// Creates a collection if it does not exist.
    pub async fn create_collection(&self, name: &str) -> CoreResult<()> {
        self.op.run(self.backend.ensure_collection(name)).await
    }

    /// Drops a collection. Returns `false` if it did not exist.
    pub async fn drop_collection(&self, name: &str) -> CoreResult<bool> {
        self.op.run(self.backend.drop_collection(name)).await
    }

    /// Reads every document of a collection.
    pub async fn documents(&self, collection: &str) -> CoreResult<Vec<(Key, Document)>> {
        self.op.run(self.backend.query(collection, None, None)).await
    }

    /// Writes a document, replacing any existing one.
    pub async fn put(&self, collection: &str, key: Key, doc: Document) -> CoreResult<()> {
        self.op
            .run(self.backend.upsert(collection, key, doc))
            .await
            .map(|_| ())
    }

    /// Deletes a document. Missing documents are ignored.
    pub async fn delete(&self, collection: &str, key: &Key) -> CoreResult<()> {
        self.op
            .run(self.backend.delete(collection, key))
            .await
            .map(|_| ())
    }
}

impl fmt::Debug for MigrationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationContext")
            .field("current_version", &self.current_version)
            .finish_non_exhaustive()
    }
}

/// Trait for defining migrations.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Returns the version number for this migration.
    ///
    /// Versions must be unique and sequential starting from 1.
    fn version(&self) -> MigrationVersion;

    /// Returns the name of this migration.
    fn name(&self) -> &str;

    /// Returns an optional description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Applies the migration.
    async fn up(&self, ctx: &MigrationContext) -> CoreResult<()>;
}

/// Registers and applies migrations against a document store.
pub struct MigrationRunner {
    backend: Arc<dyn DocumentStore>,
    migrations: BTreeMap<MigrationVersion, Box<dyn Migration>>,
}

impl MigrationRunner {
    /// Creates a runner with no migrations.
    #[must_use]
    pub fn new(backend: Arc<dyn DocumentStore>) -> Self {
        Self {
            backend,
            migrations: BTreeMap::new(),
        }
    }

    /// Registers a migration.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the version is already registered or too large
    /// to be recorded.
    pub fn register(&mut self, migration: Box<dyn Migration>) -> CoreResult<()> {
        let version = migration.version();
        record_key(version)?;
        if self.migrations.contains_key(&version) {
            return Err(CoreError::invalid_argument(format!(
                "migration version {version} already registered"
            )));
        }
        self.migrations.insert(version, migration);
        Ok(())
    }

    /// Returns registered migrations in version order.
    #[must_use]
    pub fn list(&self) -> Vec<MigrationInfo> {
        self.migrations.values().map(|m| info(m.as_ref())).collect()
    }

    /// Checks that versions start at 1 with no gaps.
    pub fn validate(&self) -> CoreResult<()> {
        for (i, version) in self.migrations.keys().enumerate() {
            let expected = i as u64 + 1;
            if *version != expected {
                return Err(CoreError::invalid_argument(format!(
                    "migration version gap: expected {expected}, got {version}"
                )));
            }
        }
        Ok(())
    }

    /// Returns every applied migration in version order.
    pub async fn applied(&self, ctx: &OpContext) -> CoreResult<Vec<AppliedMigration>> {
        ctx.run(self.backend.ensure_collection(MIGRATIONS_COLLECTION))
            .await?;
        let docs = ctx
            .run(self.backend.query(MIGRATIONS_COLLECTION, None, None))
            .await?;
        let mut applied = docs
            .into_iter()
            .map(|(_, doc)| serde_json::from_value::<AppliedMigration>(doc))
            .collect::<Result<Vec<_>, _>>()?;
        applied.sort_by_key(|m| m.version);
        Ok(applied)
    }

    /// Highest applied version, 0 if none.
    pub async fn current_version(&self, ctx: &OpContext) -> CoreResult<MigrationVersion> {
        Ok(self
            .applied(ctx)
            .await?
            .last()
            .map_or(0, |m| m.version))
    }

    /// Registered migrations not yet applied.
    pub async fn pending(&self, ctx: &OpContext) -> CoreResult<Vec<MigrationInfo>> {
        let applied = self.applied(ctx).await?;
        Ok(self
            .migrations
            .values()
            .filter(|m| !applied.iter().any(|a| a.version == m.version()))
            .map(|m| info(m.as_ref()))
            .collect())
    }

    /// Applies pending migrations in ascending order, up to `target` when
    /// given.
    ///
    /// Each migration is recorded only after it succeeds. The run stops at
    /// the first failure.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `target` is older than the current version, or
    ///   newer than every registered migration
    /// - `MigrationFailed` if a migration fails
    pub async fn run(
        &self,
        ctx: &OpContext,
        target: Option<MigrationVersion>,
    ) -> CoreResult<MigrationRunResult> {
        let applied = self.applied(ctx).await?;
        let initial_version = applied.last().map_or(0, |m| m.version);

        let latest = self.migrations.keys().next_back().copied().unwrap_or(0);
        let target = target.unwrap_or(latest.max(initial_version));
        if target < initial_version {
            return Err(CoreError::invalid_argument(format!(
                "cannot migrate down from version {initial_version} to {target}"
            )));
        }
        if target > latest.max(initial_version) {
            return Err(CoreError::invalid_argument(format!(
                "target version {target} is not registered"
            )));
        }

        let mut results = Vec::new();
        let mut current_version = initial_version;
        for (version, migration) in self.migrations.range(..=target) {
            if applied.iter().any(|a| a.version == *version) {
                continue;
            }

            let mctx = MigrationContext {
                backend: Arc::clone(&self.backend),
                op: ctx.clone(),
                current_version,
            };

            if let Err(e) = migration.up(&mctx).await {
                tracing::error!(
                    version,
                    name = migration.name(),
                    error = %e,
                    "migration failed"
                );
                return Err(CoreError::migration_failed(format!(
                    "version {version} ({}): {e}",
                    migration.name()
                )));
            }

            let record = AppliedMigration {
                version: *version,
                name: migration.name().to_string(),
                applied_at: Clock::global().now(),
            };
            ctx.run(self.backend.upsert(
                MIGRATIONS_COLLECTION,
                record_key(*version)?,
                serde_json::to_value(&record)?,
            ))
            .await?;

            tracing::info!(version, name = migration.name(), "applied migration");
            current_version = *version;
            results.push(MigrationResult {
                version: *version,
                name: migration.name().to_string(),
                success: true,
                error: None,
            });
        }

        Ok(MigrationRunResult {
            migrations: results,
            initial_version,
            final_version: current_version.max(initial_version),
        })
    }
}

impl fmt::Debug for MigrationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("versions", &self.migrations.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Key of the record for `version`.
fn record_key(version: MigrationVersion) -> CoreResult<Key> {
    i64::try_from(version).map(Key::Int).map_err(|_| {
        CoreError::invalid_argument(format!("migration version {version} is too large"))
    })
}

fn info(m: &dyn Migration) -> MigrationInfo {
    MigrationInfo {
        version: m.version(),
        name: m.name().to_string(),
        description: m.description().map(String::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metalstore_storage::InMemoryDocumentStore;
    use serde_json::json;

    struct TestMigration {
        version: MigrationVersion,
        name: String,
        should_fail: bool,
    }

    #[async_trait]
    impl Migration for TestMigration {
        fn version(&self) -> MigrationVersion {
            self.version
        }

        fn name(&self) -> &str {
            &self.name
        }

        async fn up(&self, ctx: &MigrationContext) -> CoreResult<()> {
            if self.should_fail {
                return Err(CoreError::internal("intentional failure"));
            }
            ctx.create_collection("marks").await?;
            ctx.put(
                "marks",
                Key::Int(self.version as i64),
                json!({"after": ctx.current_version}),
            )
            .await
        }
    }

    fn make_migration(version: u64, name: &str) -> Box<dyn Migration> {
        Box::new(TestMigration {
            version,
            name: name.to_string(),
            should_fail: false,
        })
    }

    fn make_failing_migration(version: u64, name: &str) -> Box<dyn Migration> {
        Box::new(TestMigration {
            version,
            name: name.to_string(),
            should_fail: true,
        })
    }

    fn runner() -> (Arc<InMemoryDocumentStore>, MigrationRunner) {
        let backend = Arc::new(InMemoryDocumentStore::new());
        let runner = MigrationRunner::new(backend.clone());
        (backend, runner)
    }

    #[test]
    fn register_and_list_migrations() {
        let (_, mut runner) = runner();
        runner.register(make_migration(2, "second")).unwrap();
        runner.register(make_migration(1, "first")).unwrap();

        let list = runner.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].version, 1);
        assert_eq!(list[0].name, "first");
        assert_eq!(list[1].name, "second");
    }

    #[test]
    fn duplicate_version_rejected() {
        let (_, mut runner) = runner();
        runner.register(make_migration(1, "first")).unwrap();
        let err = runner.register(make_migration(1, "duplicate")).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn oversized_version_rejected() {
        let (_, mut runner) = runner();
        let err = runner
            .register(make_migration(u64::MAX, "huge"))
            .unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(err.to_string().contains("too large"));
        assert!(runner.list().is_empty());
    }

    #[test]
    fn validate_detects_gaps() {
        let (_, mut runner) = runner();
        assert!(runner.validate().is_ok());
        runner.register(make_migration(1, "first")).unwrap();
        runner.register(make_migration(3, "third")).unwrap();
        assert!(runner.validate().is_err());
    }

    #[tokio::test]
    async fn run_applies_in_order_and_records() {
        let (backend, mut runner) = runner();
        runner.register(make_migration(1, "first")).unwrap();
        runner.register(make_migration(2, "second")).unwrap();
        let ctx = OpContext::background();

        assert_eq!(runner.current_version(&ctx).await.unwrap(), 0);
        let result = runner.run(&ctx, None).await.unwrap();
        assert_eq!(result.applied_count(), 2);
        assert_eq!((result.initial_version, result.final_version), (0, 2));
        assert_eq!(runner.current_version(&ctx).await.unwrap(), 2);
        assert!(runner.pending(&ctx).await.unwrap().is_empty());

        let mark = backend.get("marks", &Key::Int(2)).await.unwrap().unwrap();
        assert_eq!(mark["after"], json!(1));

        let again = runner.run(&ctx, None).await.unwrap();
        assert_eq!(again.applied_count(), 0);
    }

    #[tokio::test]
    async fn run_stops_at_target() {
        let (_, mut runner) = runner();
        for v in 1..=3 {
            runner.register(make_migration(v, "m")).unwrap();
        }
        let ctx = OpContext::background();

        runner.run(&ctx, Some(2)).await.unwrap();
        assert_eq!(runner.current_version(&ctx).await.unwrap(), 2);
        let pending = runner.pending(&ctx).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version, 3);
    }

    #[tokio::test]
    async fn downgrade_is_refused() {
        let (_, mut runner) = runner();
        runner.register(make_migration(1, "first")).unwrap();
        runner.register(make_migration(2, "second")).unwrap();
        let ctx = OpContext::background();
        runner.run(&ctx, None).await.unwrap();

        let err = runner.run(&ctx, Some(1)).await.unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(runner.current_version(&ctx).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failure_stops_execution() {
        let (_, mut runner) = runner();
        runner.register(make_migration(1, "first")).unwrap();
        runner
            .register(make_failing_migration(2, "failing"))
            .unwrap();
        runner.register(make_migration(3, "third")).unwrap();
        let ctx = OpContext::background();

        let err = runner.run(&ctx, None).await.unwrap_err();
        assert!(matches!(err, CoreError::MigrationFailed { .. }));
        assert!(err.to_string().contains("failing"));

        assert_eq!(runner.current_version(&ctx).await.unwrap(), 1);
        let pending: Vec<_> = runner
            .pending(&ctx)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.version)
            .collect();
        assert_eq!(pending, vec![2, 3]);
    }
}
