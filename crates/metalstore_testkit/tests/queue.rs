//! Integration tests for task queue delivery.

use metalstore_core::queue::FailureReason;
use metalstore_core::{
    ActionHandler, ActionRegistry, CancellationToken, CoreError, EntityId, ErrorKind, OpContext,
    QueueConfig, Step, Task, TaskQueue,
};
use metalstore_storage::LogStream;
use metalstore_testkit::prelude::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const WAIT: Duration = Duration::from_secs(5);

async fn start(env: &TestEnv, registry: ActionRegistry, cancel: CancellationToken) -> TaskQueue {
    TaskQueue::start(env.stream(), registry, QueueConfig::default(), cancel)
        .await
        .expect("Failed to start queue")
}

#[tokio::test]
async fn release_step_deletes_allocation_once() {
    let env = TestEnv::new();
    let allocations = env.entity_store::<IpAllocation>("ip_allocations").await;
    let mut alloc = IpAllocation::new("alloc-1", "10.0.0.7");
    allocations.create(&env.ctx, &mut alloc).await.unwrap();

    let calls = Arc::new(Mutex::new(Vec::<Step>::new()));
    let release = release_allocation(allocations.clone());
    let sink = Arc::clone(&calls);
    let mut registry = ActionRegistry::new();
    registry
        .register("release", move |step: Step| {
            sink.lock().push(step.clone());
            let release = release.clone();
            async move { release.handle(&step).await }
        })
        .unwrap();

    let queue = start(&env, registry, CancellationToken::new()).await;
    queue
        .insert(&env.ctx, &Task::single("alloc-1", "release"))
        .await
        .unwrap();

    wait_until(WAIT, || queue.stats().acked == 1).await;
    let calls = calls.lock().clone();
    assert_eq!(calls, vec![Step::new("alloc-1", "release")]);
    assert!(!allocations
        .exists(&env.ctx, &EntityId::from("alloc-1"))
        .await
        .unwrap());
    assert!(queue.errors().is_empty());
    queue.shutdown().await;
}

#[tokio::test]
async fn unacknowledged_entries_are_redelivered_on_start() {
    let env = TestEnv::new();
    let config = QueueConfig::default();
    env.log.ensure_group(&config.group).await.unwrap();
    let task = Task::single("alloc-9", "record");
    env.log.append(task.encode().unwrap(), 100).await.unwrap();

    // A previous worker took the entry and died before acknowledging it.
    let taken = env.log.read_next(&config.group, &config.consumer).await.unwrap();
    assert_eq!(taken.delivery_count, 1);
    assert_eq!(env.log.pending(&config.group).await.unwrap().len(), 1);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ActionRegistry::new();
    registry
        .register("record", recording_action(Arc::clone(&seen)))
        .unwrap();
    let queue = start(&env, registry, CancellationToken::new()).await;

    wait_until(WAIT, || queue.stats().acked == 1).await;
    assert_eq!(queue.stats().redelivered, 1);
    assert_eq!(seen.lock().len(), 1);
    assert!(queue.pending(&env.ctx).await.unwrap().is_empty());
    queue.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_between_steps_leaves_entry_pending() {
    let env = TestEnv::new();
    let gate = Arc::new(Semaphore::new(0));
    let first_runs = Arc::new(AtomicUsize::new(0));
    let second_runs = Arc::new(AtomicUsize::new(0));

    let registry = {
        let mut registry = ActionRegistry::new();
        let gate = Arc::clone(&gate);
        let first_runs = Arc::clone(&first_runs);
        registry
            .register("slow", move |_step: Step| {
                let gate = Arc::clone(&gate);
                let first_runs = Arc::clone(&first_runs);
                async move {
                    first_runs.fetch_add(1, Ordering::SeqCst);
                    let permit = gate
                        .acquire()
                        .await
                        .map_err(|e| CoreError::internal(e.to_string()))?;
                    permit.forget();
                    Ok::<_, CoreError>(())
                }
            })
            .unwrap();
        let second_runs = Arc::clone(&second_runs);
        registry
            .register("fast", move |_step: Step| {
                let second_runs = Arc::clone(&second_runs);
                async move {
                    second_runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CoreError>(())
                }
            })
            .unwrap();
        registry
    };

    let parent = CancellationToken::new();
    let queue = start(&env, registry.clone(), parent.clone()).await;
    let task = Task::single("m-1", "slow").then(Step::new("m-1", "fast"));
    queue.insert(&env.ctx, &task).await.unwrap();

    wait_until(WAIT, || first_runs.load(Ordering::SeqCst) == 1).await;
    parent.cancel();
    gate.add_permits(1);
    wait_until(WAIT, || !queue.is_running()).await;

    assert_eq!(second_runs.load(Ordering::SeqCst), 0);
    assert_eq!(queue.stats().acked, 0);
    let pending = queue.pending(&env.ctx).await.unwrap();
    assert_eq!(pending.len(), 1);
    drop(queue);

    gate.add_permits(1);
    let restarted = start(&env, registry, CancellationToken::new()).await;
    wait_until(WAIT, || restarted.stats().acked == 1).await;
    assert_eq!(first_runs.load(Ordering::SeqCst), 2);
    assert_eq!(second_runs.load(Ordering::SeqCst), 1);
    assert_eq!(restarted.stats().redelivered, 1);
    assert!(restarted.pending(&env.ctx).await.unwrap().is_empty());
    restarted.shutdown().await;
}

#[tokio::test]
async fn unknown_action_fails_only_its_step() {
    let env = TestEnv::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ActionRegistry::new();
    registry
        .register("record", recording_action(Arc::clone(&seen)))
        .unwrap();
    let queue = start(&env, registry, CancellationToken::new()).await;

    let task = Task::new(vec![
        Step::new("m-1", "reboot"),
        Step::new("m-1", "record"),
    ]);
    queue.insert(&env.ctx, &task).await.unwrap();

    wait_until(WAIT, || queue.stats().acked == 1).await;
    assert_eq!(seen.lock().len(), 1);

    let errors = queue.errors();
    assert_eq!(errors.len(), 1);
    let FailureReason::Steps(steps) = &errors[0].reason else {
        panic!("expected step failures, got {:?}", errors[0].reason);
    };
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].index, 0);
    assert_eq!(steps[0].kind, ErrorKind::Internal);
    assert!(steps[0].message.contains("unimplemented action: reboot"));

    let joined = queue.joined_error().unwrap();
    assert!(joined.to_string().contains("reboot"));
    queue.shutdown().await;
}

#[tokio::test]
async fn tasks_run_in_insertion_order() {
    let env = TestEnv::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ActionRegistry::new();
    registry
        .register("record", recording_action(Arc::clone(&seen)))
        .unwrap();
    let queue = start(&env, registry, CancellationToken::new()).await;

    let ctx = OpContext::background();
    let mut ids = Vec::new();
    for i in 0..20 {
        let id = queue
            .insert(&ctx, &Task::single(format!("m-{i}"), "record"))
            .await
            .unwrap();
        ids.push(id);
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    wait_until(WAIT, || queue.stats().acked == 20).await;
    let targets: Vec<String> = seen
        .lock()
        .iter()
        .map(|s| s.target_id.as_str().to_string())
        .collect();
    let expected: Vec<String> = (0..20).map(|i| format!("m-{i}")).collect();
    assert_eq!(targets, expected);
    assert_eq!(env.log.len().await.unwrap(), 20);
}

#[tokio::test]
async fn insert_honours_cancelled_context() {
    let env = TestEnv::new();
    let queue = start(&env, ActionRegistry::new(), CancellationToken::new()).await;
    let ctx = OpContext::background();
    ctx.cancel();

    let err = queue
        .insert(&ctx, &Task::single("m-1", "record"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Cancelled));
    queue.shutdown().await;
}
