//! Durable, ordered task queue.
//!
//! Callers append [`Task`]s to a capped log stream; exactly one background
//! worker per queue reads them through a consumer group, runs each step's
//! registered [`ActionHandler`] in order and acknowledges the entry once it
//! has been handled.
//!
//! ## Delivery
//!
//! ```text
//!   insert ──► append(CBOR {task}) ──► log ──► read_next ──► run steps ──► ack
//!                                               ▲
//!   start ──► redeliver_pending ─────────────────┘  (entries never acked)
//! ```
//!
//! Delivery is at-least-once: an entry delivered but not acknowledged
//! before a crash or shutdown is handled again on the next start. Step
//! failures never stop later steps and are never retried by the queue; they
//! are logged and kept in memory for [`TaskQueue::errors`].

mod registry;
mod stats;
mod task;
mod worker;

pub use registry::{ActionHandler, ActionRegistry};
pub use stats::{QueueStats, QueueStatsSnapshot};
pub use task::{ActionKind, FailureReason, Step, StepFailure, Task, TaskFailure, TaskId};

use crate::config::QueueConfig;
use crate::context::OpContext;
use crate::error::{CoreError, CoreResult};
use metalstore_storage::{EntryId, LogStream, PendingEntry};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worker::{Shared, Worker};

/// Handle to a running task queue.
///
/// Dropping the handle stops the worker; use [`TaskQueue::shutdown`] to also
/// wait for it.
pub struct TaskQueue {
    stream: Arc<dyn LogStream>,
    config: QueueConfig,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Creates the consumer group if needed and spawns the worker.
    ///
    /// The worker stops when `cancel` (or a parent of it) is cancelled, or
    /// when this handle is shut down or dropped. A step already running is
    /// allowed to finish; the rest of its task stays pending.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        stream: Arc<dyn LogStream>,
        registry: ActionRegistry,
        config: QueueConfig,
        cancel: CancellationToken,
    ) -> CoreResult<Self> {
        stream.ensure_group(&config.group).await?;

        let cancel = cancel.child_token();
        let shared = Arc::new(Shared::default());
        tracing::info!(
            group = %config.group,
            consumer = %config.consumer,
            actions = ?registry.kinds(),
            "starting task queue"
        );

        let worker = Worker {
            stream: Arc::clone(&stream),
            registry,
            config: config.clone(),
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Ok(Self {
            stream,
            config,
            shared,
            cancel,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Appends a task to the log and returns its entry id.
    ///
    /// Returns as soon as the log acknowledges the append; processing
    /// happens later on the worker.
    ///
    /// # Errors
    ///
    /// Encoding and append failures.
    pub async fn insert(&self, ctx: &OpContext, task: &Task) -> CoreResult<EntryId> {
        let payload = task.encode()?;
        let entry_id = ctx
            .run(self.stream.append(payload, self.config.max_len))
            .await?;
        tracing::debug!(
            task_id = %task.id,
            entry_id = %entry_id,
            steps = task.steps.len(),
            "enqueued task"
        );
        Ok(entry_id)
    }

    /// Entries delivered to the group but not yet acknowledged.
    pub async fn pending(&self, ctx: &OpContext) -> CoreResult<Vec<PendingEntry>> {
        ctx.run(self.stream.pending(&self.config.group)).await
    }

    /// Every failure recorded since this queue started, oldest first.
    #[must_use]
    pub fn errors(&self) -> Vec<TaskFailure> {
        self.shared.failures.lock().clone()
    }

    /// All recorded failures joined into one error, or `None` if there were
    /// none.
    #[must_use]
    pub fn joined_error(&self) -> Option<CoreError> {
        let failures = self.shared.failures.lock();
        CoreError::join(failures.iter().map(TaskFailure::to_error).collect())
    }

    /// Worker counters.
    #[must_use]
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// The queue configuration.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Returns true while the worker is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the worker and waits for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "task queue worker panicked");
            }
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
