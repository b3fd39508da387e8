//! Stress tests for metalstore.
//!
//! These helpers drive the core types from many concurrent tokio tasks and
//! report how the operations ended.

use crate::fixtures::{recording_action, Machine};
use metalstore_core::{
    ActionRegistry, CancellationToken, CoreResult, EntityStore, IntegerPool, OpContext,
    QueueConfig, Task, TaskQueue,
};
use metalstore_storage::LogStream;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Operations that lost an optimistic race.
    pub conflicts: usize,
    /// Operations that failed for any other reason.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, conflicts: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + conflicts + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            conflicts,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Conflicts: {}", self.conflicts);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent tokio tasks.
    pub tasks: usize,
    /// Number of distinct entities.
    pub entity_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            tasks: 8,
            entity_count: 16,
        }
    }
}

#[derive(Default)]
struct Tally {
    successful: usize,
    conflicts: usize,
    failed: usize,
}

impl Tally {
    fn record<T>(&mut self, result: &CoreResult<T>) {
        match result {
            Ok(_) => self.successful += 1,
            Err(e) if e.is_conflict() => self.conflicts += 1,
            Err(_) => self.failed += 1,
        }
    }

    fn finish(self, start: Instant) -> StressTestResult {
        StressTestResult::new(self.successful, self.conflicts, self.failed, start.elapsed())
    }
}

/// Creates `config.operations` machines one after another.
pub async fn stress_sequential_creates(
    store: &EntityStore<Machine>,
    ctx: &OpContext,
    config: &StressConfig,
) -> StressTestResult {
    let start = Instant::now();
    let mut tally = Tally::default();

    for i in 0..config.operations {
        let mut machine = Machine::new(&format!("seq-{i}"), "rack-1");
        tally.record(&store.create(ctx, &mut machine).await);
    }

    tally.finish(start)
}

/// Races `config.tasks` updates against the same snapshot, once per round.
///
/// There are `config.operations / config.tasks` rounds spread over
/// `config.entity_count` machines. Every round should end with at most one
/// success and conflicts for the rest.
pub async fn stress_update_race(
    store: &EntityStore<Machine>,
    ctx: &OpContext,
    config: &StressConfig,
) -> StressTestResult {
    let mut ids = Vec::with_capacity(config.entity_count);
    for i in 0..config.entity_count {
        let mut machine = Machine::new(&format!("race-{i}"), "rack-1");
        if store.create(ctx, &mut machine).await.is_ok() {
            ids.push(machine.meta.id);
        }
    }

    let start = Instant::now();
    let mut tally = Tally::default();
    let rounds = config.operations / config.tasks.max(1);

    for round in 0..rounds {
        let Some(id) = ids.get(round % ids.len().max(1)) else {
            break;
        };
        let old = match store.get(ctx, id).await {
            Ok(old) => old,
            Err(e) => {
                tally.record::<()>(&Err(e));
                continue;
            }
        };

        let mut set = JoinSet::new();
        for t in 0..config.tasks {
            let store = store.clone();
            let ctx = ctx.clone();
            let old = old.clone();
            set.spawn(async move {
                let mut new = old.clone();
                new.state = format!("round-{round}-task-{t}");
                store.update(&ctx, &mut new, &old).await
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => tally.record(&result),
                Err(_) => tally.failed += 1,
            }
        }
    }

    tally.finish(start)
}

/// Acquires random integers from `config.tasks` concurrent tasks.
///
/// Returns every acquired value alongside the result; no value may appear
/// twice.
pub async fn stress_pool_contention(
    pool: Arc<IntegerPool>,
    ctx: &OpContext,
    config: &StressConfig,
) -> (StressTestResult, Vec<u32>) {
    let acquired = Arc::new(Mutex::new(Vec::with_capacity(config.operations)));
    let per_task = config.operations / config.tasks.max(1);

    let start = Instant::now();
    let mut set = JoinSet::new();
    for _ in 0..config.tasks {
        let pool = Arc::clone(&pool);
        let ctx = ctx.clone();
        let acquired = Arc::clone(&acquired);
        set.spawn(async move {
            let mut tally = Tally::default();
            for _ in 0..per_task {
                let result = pool.acquire_random(&ctx).await;
                if let Ok(value) = result {
                    acquired.lock().push(value);
                }
                tally.record(&result);
            }
            tally
        });
    }

    let mut total = Tally::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(tally) => {
                total.successful += tally.successful;
                total.conflicts += tally.conflicts;
                total.failed += tally.failed;
            }
            Err(_) => total.failed += per_task,
        }
    }

    let values = std::mem::take(&mut *acquired.lock());
    (total.finish(start), values)
}

/// Pushes `config.operations` single-step tasks through a fresh queue and
/// waits until every one of them is acknowledged or `timeout` passes.
pub async fn stress_queue_throughput(
    stream: Arc<dyn LogStream>,
    config: &StressConfig,
    timeout: Duration,
) -> StressTestResult {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ActionRegistry::new();
    if registry
        .register("record", recording_action(Arc::clone(&seen)))
        .is_err()
    {
        return StressTestResult::new(0, 0, config.operations, Duration::ZERO);
    }

    let queue_config = QueueConfig::default().max_len(config.operations.max(1));
    let queue = match TaskQueue::start(stream, registry, queue_config, CancellationToken::new())
        .await
    {
        Ok(queue) => queue,
        Err(_) => return StressTestResult::new(0, 0, config.operations, Duration::ZERO),
    };

    let ctx = OpContext::background();
    let start = Instant::now();
    let mut tally = Tally::default();
    for i in 0..config.operations {
        let result = queue
            .insert(&ctx, &Task::single(format!("item-{i}"), "record"))
            .await;
        if result.is_err() {
            tally.record(&result);
        }
    }

    let inserted = config.operations - tally.failed;
    let _ = tokio::time::timeout(timeout, async {
        while (queue.stats().acked as usize) < inserted {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;

    let acked = queue.stats().acked as usize;
    tally.successful = acked;
    tally.failed += inserted.saturating_sub(acked);
    queue.shutdown().await;
    tally.finish(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestEnv;
    use metalstore_core::{PoolConfig, RetryPolicy};
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_sequential_creates() {
        let env = TestEnv::new();
        let store = env.entity_store::<Machine>("machines").await;
        let config = StressConfig {
            operations: 200,
            ..Default::default()
        };

        let result = stress_sequential_creates(&store, &env.ctx, &config).await;
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 200);
        assert_eq!(store.count(&env.ctx, &[]).await.unwrap(), 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_update_race_has_one_winner_per_round() {
        let env = TestEnv::new();
        let store = env.entity_store::<Machine>("machines").await;
        let config = StressConfig {
            operations: 400,
            tasks: 8,
            entity_count: 5,
        };

        let result = stress_update_race(&store, &env.ctx, &config).await;
        let rounds = config.operations / config.tasks;
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.total_ops, config.operations);
        assert!(result.successful_ops <= rounds);
        assert!(result.successful_ops >= 1);
        assert_eq!(result.successful_ops + result.conflicts, config.operations);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_contention_hands_out_unique_values() {
        let env = TestEnv::new();
        let config = PoolConfig::new("contended", 1, 256).with_retry(RetryPolicy::new(50));
        let pool = Arc::new(
            IntegerPool::open(env.backend(), config, &env.ctx)
                .await
                .unwrap(),
        );
        let stress = StressConfig {
            operations: 256,
            tasks: 8,
            entity_count: 0,
        };

        let (result, values) = stress_pool_contention(pool.clone(), &env.ctx, &stress).await;
        assert_eq!(result.failed_ops, 0);
        assert_eq!(values.len(), result.successful_ops);
        let unique: HashSet<_> = values.iter().collect();
        assert_eq!(unique.len(), values.len());
        assert_eq!(
            pool.free_count(&env.ctx).await.unwrap(),
            256 - values.len()
        );
    }

    #[tokio::test]
    async fn test_queue_throughput() {
        let env = TestEnv::new();
        let config = StressConfig {
            operations: 300,
            ..Default::default()
        };

        let result =
            stress_queue_throughput(env.stream(), &config, Duration::from_secs(10)).await;
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 300);
    }
}
