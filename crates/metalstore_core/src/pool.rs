//! Bounded integer pool.
//!
//! Hands out unique integers from `[min, max]` (VRF ids, ASNs and the like)
//! to any number of concurrent callers across processes, with no locks.
//!
//! ## Layout
//!
//! ```text
//!   <name>        one slot document per FREE integer, keyed by the integer
//!                 { "id": 4711 }
//!   <name>_info   one marker document keyed by the pool name
//!                 { "initialized": true, "min": 1, "max": 131072, "seeded_at": ... }
//! ```
//!
//! Presence of a slot means free; absence means allocated. Acquiring is a
//! delete that returns the removed document, so exactly one caller can ever
//! observe a given slot disappearing. Free slots plus acquired integers
//! always partition the range.

use crate::clock::Clock;
use crate::config::PoolConfig;
use crate::context::OpContext;
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use metalstore_storage::{Document, DocumentStore, Key, OnConflict};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Seeding marker stored in the `<name>_info` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    /// Whether the slots have been seeded. `false` while a seeding run
    /// holds the claim.
    pub initialized: bool,
    /// Lower bound the pool was seeded with.
    pub min: u32,
    /// Upper bound the pool was seeded with.
    pub max: u32,
    /// When the marker was last written.
    pub seeded_at: DateTime<Utc>,
}

/// A pool of unique integers backed by a document store.
pub struct IntegerPool {
    backend: Arc<dyn DocumentStore>,
    config: PoolConfig,
    info_collection: String,
}

impl IntegerPool {
    /// Opens the pool, creating its collections and seeding it on first use.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the configuration is invalid or the pool was
    /// seeded with a different range.
    pub async fn open(
        backend: Arc<dyn DocumentStore>,
        config: PoolConfig,
        ctx: &OpContext,
    ) -> CoreResult<Self> {
        config.validate()?;
        let info_collection = format!("{}_info", config.name);
        ctx.run(backend.ensure_collection(&config.name)).await?;
        ctx.run(backend.ensure_collection(&info_collection)).await?;

        let pool = Self {
            backend,
            config,
            info_collection,
        };
        pool.initialize(ctx).await?;
        Ok(pool)
    }

    /// The pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The allocatable range.
    #[must_use]
    pub fn range(&self) -> RangeInclusive<u32> {
        self.config.min..=self.config.max
    }

    /// Seeds every slot in the range, once per pool lifetime.
    ///
    /// Returns `true` if this call seeded the pool and `false` if it was
    /// already seeded. The marker is claimed with an insert before seeding,
    /// and the slots are written all-or-nothing with
    /// [`OnConflict::Error`], so a slot that already exists (and every
    /// integer already handed out) is never touched. A claimed marker that
    /// never reached `initialized` is completed by the next caller that
    /// reads it; a caller that loses the claim but cannot read the marker
    /// leaves the slots alone.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the pool was seeded with a different range.
    pub async fn initialize(&self, ctx: &OpContext) -> CoreResult<bool> {
        let marker_key = Key::from(self.config.name.as_str());
        let claim = serde_json::to_value(self.marker(false))?;
        let claimed = match ctx
            .run(
                self.backend
                    .insert(&self.info_collection, marker_key.clone(), claim),
            )
            .await
        {
            Ok(()) => true,
            Err(e) if e.is_conflict() => false,
            Err(e) => return Err(e),
        };

        if !claimed {
            // The failed insert proves the marker exists; a read that misses
            // it is lagging, and seeding on it could re-free acquired values.
            let Some(info) = self.info(ctx).await? else {
                tracing::warn!(
                    pool = %self.config.name,
                    "pool marker not readable, skipping seeding"
                );
                return Ok(false);
            };
            self.check_marker(&info)?;
            if info.initialized {
                tracing::debug!(pool = %self.config.name, "pool already seeded");
                return Ok(false);
            }
            tracing::warn!(pool = %self.config.name, "completing unfinished seeding");
        }

        let slots: Vec<(Key, Document)> = self
            .range()
            .map(|value| (Key::from(value), slot(value)))
            .collect();
        let seeded = match ctx
            .run(
                self.backend
                    .insert_many(&self.config.name, slots, OnConflict::Error),
            )
            .await
        {
            Ok(written) => Some(written),
            Err(e) if e.is_conflict() => None,
            Err(e) => return Err(e),
        };

        ctx.run(self.backend.upsert(
            &self.info_collection,
            marker_key,
            serde_json::to_value(self.marker(true))?,
        ))
        .await?;

        match seeded {
            Some(written) => {
                tracing::info!(
                    pool = %self.config.name,
                    min = self.config.min,
                    max = self.config.max,
                    slots = written,
                    "seeded integer pool"
                );
                Ok(true)
            }
            None => {
                tracing::info!(
                    pool = %self.config.name,
                    "slots already present, marked pool seeded"
                );
                Ok(false)
            }
        }
    }

    /// Reads the seeding marker.
    pub async fn info(&self, ctx: &OpContext) -> CoreResult<Option<PoolInfo>> {
        let doc = ctx
            .run(
                self.backend
                    .get(&self.info_collection, &Key::from(self.config.name.as_str())),
            )
            .await?;
        doc.map(serde_json::from_value)
            .transpose()
            .map_err(CoreError::from)
    }

    /// Acquires a free integer chosen at random.
    ///
    /// Losing a race for the sampled slot is retried according to the pool's
    /// retry policy.
    ///
    /// # Errors
    ///
    /// - `Internal` if the pool is exhausted (never retried)
    /// - `Conflict` if every attempt lost its race
    pub async fn acquire_random(&self, ctx: &OpContext) -> CoreResult<u32> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                ctx.sleep(retry.delay_for_attempt(attempt)).await?;
            }

            match self.try_acquire_random(ctx).await {
                Ok(value) => {
                    tracing::debug!(pool = %self.config.name, value, attempt, "acquired integer");
                    return Ok(value);
                }
                Err(e) if e.is_conflict() && attempt + 1 < retry.max_attempts => {
                    tracing::debug!(pool = %self.config.name, attempt, "lost race for sampled slot");
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_conflict() {
                        tracing::warn!(
                            pool = %self.config.name,
                            attempts = attempt + 1,
                            "gave up acquiring after repeated contention"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn try_acquire_random(&self, ctx: &OpContext) -> CoreResult<u32> {
        let removed = ctx
            .run(self.backend.delete_random(&self.config.name))
            .await?;

        match removed {
            Some((_, doc)) => self.slot_value(&doc),
            None => {
                let remaining = ctx.run(self.backend.count(&self.config.name)).await?;
                if remaining == 0 {
                    Err(CoreError::internal(format!(
                        "exhausted pool {}",
                        self.config.name
                    )))
                } else {
                    Err(CoreError::conflict(format!(
                        "sampled value in pool {} already acquired by another",
                        self.config.name
                    )))
                }
            }
        }
    }

    /// Acquires a specific integer.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `value` is outside the range
    /// - `Conflict` if `value` is already acquired
    pub async fn acquire(&self, ctx: &OpContext, value: u32) -> CoreResult<()> {
        self.check_range(value)?;
        let removed = ctx
            .run(self.backend.delete(&self.config.name, &Key::from(value)))
            .await?;
        if removed.is_none() {
            return Err(CoreError::conflict(format!(
                "{value} in pool {} already acquired by another",
                self.config.name
            )));
        }
        tracing::debug!(pool = %self.config.name, value, "acquired integer");
        Ok(())
    }

    /// Returns an integer to the pool. Releasing a free integer is a no-op.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `value` is outside the range.
    pub async fn release(&self, ctx: &OpContext, value: u32) -> CoreResult<()> {
        self.check_range(value)?;
        let previous = ctx
            .run(
                self.backend
                    .upsert(&self.config.name, Key::from(value), slot(value)),
            )
            .await?;
        tracing::debug!(
            pool = %self.config.name,
            value,
            was_free = previous.is_some(),
            "released integer"
        );
        Ok(())
    }

    /// Number of free integers.
    pub async fn free_count(&self, ctx: &OpContext) -> CoreResult<usize> {
        ctx.run(self.backend.count(&self.config.name)).await
    }

    /// Returns true if `value` is currently free.
    pub async fn is_free(&self, ctx: &OpContext, value: u32) -> CoreResult<bool> {
        self.check_range(value)?;
        Ok(ctx
            .run(self.backend.get(&self.config.name, &Key::from(value)))
            .await?
            .is_some())
    }

    fn check_range(&self, value: u32) -> CoreResult<()> {
        if !self.range().contains(&value) {
            return Err(CoreError::invalid_argument(format!(
                "{value} is outside allowed range [{}, {}] of pool {}",
                self.config.min, self.config.max, self.config.name
            )));
        }
        Ok(())
    }

    fn check_marker(&self, info: &PoolInfo) -> CoreResult<()> {
        if (info.min, info.max) != (self.config.min, self.config.max) {
            return Err(CoreError::invalid_argument(format!(
                "pool {} was seeded with range [{}, {}], configured range is [{}, {}]",
                self.config.name, info.min, info.max, self.config.min, self.config.max
            )));
        }
        Ok(())
    }

    fn marker(&self, initialized: bool) -> PoolInfo {
        PoolInfo {
            initialized,
            min: self.config.min,
            max: self.config.max,
            seeded_at: Clock::global().now(),
        }
    }

    fn slot_value(&self, doc: &Document) -> CoreResult<u32> {
        doc.get("id")
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| self.range().contains(v))
            .ok_or_else(|| {
                CoreError::internal(format!(
                    "malformed slot in pool {}: {doc}",
                    self.config.name
                ))
            })
    }
}

impl fmt::Debug for IntegerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegerPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn slot(value: u32) -> Document {
    json!({ "id": value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::error::ErrorKind;
    use metalstore_storage::InMemoryDocumentStore;
    use std::collections::HashSet;

    async fn pool(min: u32, max: u32) -> (OpContext, Arc<InMemoryDocumentStore>, IntegerPool) {
        let ctx = OpContext::background();
        let backend = Arc::new(InMemoryDocumentStore::new());
        let pool = IntegerPool::open(backend.clone(), PoolConfig::new("vrf", min, max), &ctx)
            .await
            .unwrap();
        (ctx, backend, pool)
    }

    #[tokio::test]
    async fn open_seeds_every_slot_once() {
        let (ctx, _, pool) = pool(1, 100).await;
        assert_eq!(pool.free_count(&ctx).await.unwrap(), 100);

        let info = pool.info(&ctx).await.unwrap().unwrap();
        assert!(info.initialized);
        assert_eq!((info.min, info.max), (1, 100));

        pool.acquire(&ctx, 5).await.unwrap();
        assert!(!pool.initialize(&ctx).await.unwrap());
        assert_eq!(pool.free_count(&ctx).await.unwrap(), 99);
        assert!(!pool.is_free(&ctx, 5).await.unwrap());
    }

    #[tokio::test]
    async fn reopening_with_another_range_is_rejected() {
        let (ctx, backend, _pool) = pool(1, 100).await;
        let err = IntegerPool::open(backend, PoolConfig::new("vrf", 1, 200), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(err.to_string().contains("seeded with range [1, 100]"));
    }

    #[tokio::test]
    async fn unfinished_claim_is_completed_without_refreeing() {
        let (ctx, backend, pool) = pool(1, 10).await;
        pool.acquire(&ctx, 3).await.unwrap();

        // Seeded slots present, marker left in the claimed state.
        let mut info = pool.info(&ctx).await.unwrap().unwrap();
        info.initialized = false;
        backend
            .upsert("vrf_info", Key::from("vrf"), serde_json::to_value(&info).unwrap())
            .await
            .unwrap();

        assert!(!pool.initialize(&ctx).await.unwrap());
        assert!(pool.info(&ctx).await.unwrap().unwrap().initialized);
        assert_eq!(pool.free_count(&ctx).await.unwrap(), 9);
        assert!(!pool.is_free(&ctx, 3).await.unwrap());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let backend = Arc::new(InMemoryDocumentStore::new());
        let err = IntegerPool::open(
            backend,
            PoolConfig::new("vrf", 9, 1),
            &OpContext::background(),
        )
        .await
        .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[tokio::test]
    async fn acquire_release_cycle() {
        let (ctx, _, pool) = pool(1, 131_072).await;

        pool.acquire(&ctx, 10).await.unwrap();
        let err = pool.acquire(&ctx, 10).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        pool.release(&ctx, 10).await.unwrap();
        pool.release(&ctx, 10).await.unwrap();
        pool.acquire(&ctx, 10).await.unwrap();
    }

    #[tokio::test]
    async fn out_of_range_is_invalid_argument() {
        let (ctx, _, pool) = pool(1, 131_072).await;
        let err = pool.acquire(&ctx, 524_288).await.unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(err.to_string().contains("outside allowed range"));

        assert!(pool.release(&ctx, 0).await.unwrap_err().is_invalid_argument());
    }

    #[tokio::test]
    async fn acquire_random_drains_then_exhausts() {
        let (ctx, _, pool) = pool(7, 12).await;

        let mut seen = HashSet::new();
        for _ in 0..6 {
            let value = pool.acquire_random(&ctx).await.unwrap();
            assert!(pool.range().contains(&value));
            assert!(seen.insert(value));
        }

        let err = pool.acquire_random(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("exhausted pool"));

        pool.release(&ctx, 9).await.unwrap();
        assert_eq!(pool.acquire_random(&ctx).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn concurrent_random_acquires_are_unique() {
        let ctx = OpContext::background();
        let backend = Arc::new(InMemoryDocumentStore::new());
        let config = PoolConfig::new("asn", 1, 64).with_retry(RetryPolicy::new(50));
        let pool = Arc::new(IntegerPool::open(backend, config, &ctx).await.unwrap());

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let ctx = ctx.clone();
                tokio::spawn(async move { pool.acquire_random(&ctx).await })
            })
            .collect();

        let mut values = HashSet::new();
        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert!(values.insert(value));
        }
        assert_eq!(pool.free_count(&ctx).await.unwrap() + values.len(), 64);
    }
}
