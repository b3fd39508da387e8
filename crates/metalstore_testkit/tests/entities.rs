//! Integration tests for entity stores and integer pools.

use metalstore_core::{
    CoreError, EntityId, EntityStore, ErrorKind, Filter, IntegerPool, OpContext, PoolConfig,
    RetryPolicy,
};
use metalstore_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;

async fn created_machine(store: &EntityStore<Machine>, ctx: &OpContext, id: &str) -> Machine {
    let mut machine = Machine::new(id, "rack-1");
    store.create(ctx, &mut machine).await.unwrap();
    machine
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_from_one_version_have_single_winner() {
    let env = TestEnv::new();
    let store = env.entity_store::<Machine>("machines").await;
    let base = created_machine(&store, &env.ctx, "m-1").await;

    let mut set = JoinSet::new();
    for i in 0..16 {
        let store = store.clone();
        let ctx = env.ctx.clone();
        let old = base.clone();
        set.spawn(async move {
            let mut new = old.clone();
            new.state = format!("allocated-{i}");
            store.update(&ctx, &mut new, &old).await
        });
    }

    let mut winners = 0;
    while let Some(joined) = set.join_next().await {
        match joined.unwrap() {
            Ok(()) => winners += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict, "unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);

    let stored = store.get(&env.ctx, &base.meta.id).await.unwrap();
    assert_ne!(stored.state, "ready");
}

#[tokio::test]
async fn stale_copy_update_conflicts() {
    let env = TestEnv::new();
    let store = env.entity_store::<Machine>("machines").await;
    let original = created_machine(&store, &env.ctx, "m-1").await;

    let mut first = original.clone();
    first.state = "allocated".to_string();
    store.update(&env.ctx, &mut first, &original).await.unwrap();

    let mut stale = original.clone();
    stale.state = "wiped".to_string();
    let err = store.update(&env.ctx, &mut stale, &original).await.unwrap_err();
    assert!(err.is_conflict());

    let stored = store.get(&env.ctx, &original.meta.id).await.unwrap();
    assert_eq!(stored.state, "allocated");
}

#[tokio::test]
async fn find_distinguishes_zero_one_and_many() {
    let env = TestEnv::new();
    let store = env.entity_store::<Machine>("machines").await;
    let ctx = &env.ctx;

    let err = store
        .find(ctx, &[Filter::field_eq("rack", "rack-1")])
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    created_machine(&store, ctx, "m-1").await;
    let found = store
        .find(ctx, &[Filter::field_eq("rack", "rack-1")])
        .await
        .unwrap();
    assert_eq!(found.meta.id.as_str(), "m-1");

    created_machine(&store, ctx, "m-2").await;
    let err = store
        .find(ctx, &[Filter::field_eq("rack", "rack-1")])
        .await
        .unwrap_err();
    assert!(!err.is_not_found());
    assert!(!err.is_conflict());
    assert!(matches!(err, CoreError::MoreThanOne { .. }));
    assert!(err.to_string().contains("more than one exists"));

    let narrowed = store
        .find(
            ctx,
            &[
                Filter::field_eq("rack", "rack-1"),
                Filter::id_in([EntityId::from("m-2")]),
            ],
        )
        .await
        .unwrap();
    assert_eq!(narrowed.meta.id.as_str(), "m-2");
}

#[tokio::test]
async fn release_then_reacquire_in_large_pool() {
    let env = TestEnv::new();
    let pool = env.pool("vrf", 1, 131_072).await;
    let ctx = &env.ctx;

    pool.acquire(ctx, 10).await.unwrap();
    let err = pool.acquire(ctx, 10).await.unwrap_err();
    assert!(err.is_conflict());
    pool.release(ctx, 10).await.unwrap();
    pool.acquire(ctx, 10).await.unwrap();

    let err = pool.acquire(ctx, 524_288).await.unwrap_err();
    assert!(err.is_invalid_argument());
    assert!(err.to_string().contains("outside allowed range"));
}

#[tokio::test]
async fn seeding_twice_inserts_once() {
    let env = TestEnv::new();
    let counting = Arc::new(CountingDocumentStore::new(env.backend()));
    let config = PoolConfig::new("asn", 4_200_000_000, 4_200_000_999);

    let pool = IntegerPool::open(counting.clone(), config.clone(), &env.ctx)
        .await
        .unwrap();
    assert_eq!(counting.insert_many_calls(), 1);
    assert!(!pool.initialize(&env.ctx).await.unwrap());

    let reopened = IntegerPool::open(counting.clone(), config, &env.ctx)
        .await
        .unwrap();
    assert_eq!(counting.insert_many_calls(), 1);
    assert_eq!(reopened.free_count(&env.ctx).await.unwrap(), 1000);
    assert!(reopened.info(&env.ctx).await.unwrap().unwrap().initialized);
}

#[tokio::test]
async fn lagging_marker_read_does_not_refree_acquired_values() {
    let env = TestEnv::new();
    let first = env.pool("vrf", 1, 100).await;
    first.acquire(&env.ctx, 10).await.unwrap();

    let lagging = Arc::new(StaleReadDocumentStore::new(env.backend(), "vrf_info", 1));
    let second = IntegerPool::open(lagging.clone(), PoolConfig::new("vrf", 1, 100), &env.ctx)
        .await
        .unwrap();
    assert_eq!(lagging.remaining(), 0);

    assert_eq!(second.free_count(&env.ctx).await.unwrap(), 99);
    assert!(!second.is_free(&env.ctx, 10).await.unwrap());
    let err = second.acquire(&env.ctx, 10).await.unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn lagging_marker_read_over_exhausted_pool_seeds_nothing() {
    let env = TestEnv::new();
    let first = env.pool("tiny", 5, 6).await;
    first.acquire(&env.ctx, 5).await.unwrap();
    first.acquire(&env.ctx, 6).await.unwrap();

    let lagging = Arc::new(StaleReadDocumentStore::new(env.backend(), "tiny_info", 1));
    let second = IntegerPool::open(lagging, PoolConfig::new("tiny", 5, 6), &env.ctx)
        .await
        .unwrap();
    assert_eq!(second.free_count(&env.ctx).await.unwrap(), 0);
    let err = second.acquire_random(&env.ctx).await.unwrap_err();
    assert!(err.to_string().contains("exhausted pool"));
}

#[tokio::test]
async fn lost_races_exhaust_retries_with_conflict() {
    let env = TestEnv::new();
    let contended = Arc::new(ContendedDocumentStore::new(env.backend()));
    let config = PoolConfig::new("vni", 1, 8).with_retry(RetryPolicy::new(3));
    let pool = IntegerPool::open(contended, config, &env.ctx).await.unwrap();

    let err = pool.acquire_random(&env.ctx).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(pool.free_count(&env.ctx).await.unwrap(), 8);
}

#[tokio::test]
async fn exhausted_pool_is_internal_error() {
    let env = TestEnv::new();
    let pool = env.pool("tiny", 5, 6).await;
    let ctx = &env.ctx;

    let mut got = HashSet::new();
    got.insert(pool.acquire_random(ctx).await.unwrap());
    got.insert(pool.acquire_random(ctx).await.unwrap());
    assert_eq!(got, HashSet::from([5, 6]));

    let err = pool.acquire_random(ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("exhausted pool"));
}

#[derive(Debug, Clone)]
enum PoolOp {
    AcquireRandom,
    Acquire(u32),
    Release(u32),
}

fn pool_op_strategy(max: u32) -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        Just(PoolOp::AcquireRandom),
        (1..=max).prop_map(PoolOp::Acquire),
        (1..=max).prop_map(PoolOp::Release),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn free_and_acquired_partition_the_range(ops in prop::collection::vec(pool_op_strategy(16), 0..60)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let env = TestEnv::new();
            let pool = env.pool("partition", 1, 16).await;
            let ctx = &env.ctx;
            let mut acquired = HashSet::new();

            for op in ops {
                match op {
                    PoolOp::AcquireRandom => {
                        if let Ok(value) = pool.acquire_random(ctx).await {
                            prop_assert!(acquired.insert(value));
                        }
                    }
                    PoolOp::Acquire(value) => {
                        let result = pool.acquire(ctx, value).await;
                        prop_assert_eq!(result.is_ok(), acquired.insert(value));
                    }
                    PoolOp::Release(value) => {
                        pool.release(ctx, value).await.unwrap();
                        acquired.remove(&value);
                    }
                }

                let free = pool.free_count(ctx).await.unwrap();
                prop_assert_eq!(free + acquired.len(), 16);
            }
            Ok(())
        })?;
    }
}
