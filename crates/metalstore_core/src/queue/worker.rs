//! The single background consumer of a task queue.

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::queue::registry::ActionRegistry;
use crate::queue::stats::QueueStats;
use crate::queue::task::{FailureReason, StepFailure, Task, TaskFailure};
use metalstore_storage::{LogEntry, LogStream, StorageError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pause after a failed read before trying again.
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// State shared between the queue handle and its worker.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) failures: Mutex<Vec<TaskFailure>>,
    pub(crate) stats: QueueStats,
}

/// Outcome of handling one entry.
enum Handled {
    /// Processing finished; the entry may be acknowledged.
    Done,
    /// Cancellation arrived between steps; leave the entry pending.
    Interrupted,
}

pub(crate) struct Worker {
    pub(crate) stream: Arc<dyn LogStream>,
    pub(crate) registry: ActionRegistry,
    pub(crate) config: QueueConfig,
    pub(crate) shared: Arc<Shared>,
    pub(crate) cancel: CancellationToken,
}

impl Worker {
    pub(crate) async fn run(self) {
        let group = self.config.group.as_str();
        let consumer = self.config.consumer.as_str();
        tracing::info!(group, consumer, "task queue worker started");

        if self.config.redeliver_on_start {
            self.drain_pending().await;
        }

        while !self.cancel.is_cancelled() {
            let read = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                read = self.stream.read_next(group, consumer) => read,
            };

            match read {
                Ok(entry) => {
                    self.shared.stats.record_delivered(false);
                    self.process(entry).await;
                }
                Err(StorageError::Closed) => {
                    tracing::warn!(group, consumer, "task log closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(group, consumer, error = %e, "failed to read task log");
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(READ_RETRY_DELAY) => {}
                    }
                }
            }
        }

        tracing::info!(group, consumer, "task queue worker stopped");
    }

    async fn drain_pending(&self) {
        let group = self.config.group.as_str();
        let consumer = self.config.consumer.as_str();
        let entries = match self.stream.redeliver_pending(group, consumer).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(group, consumer, error = %e, "failed to read pending entries");
                return;
            }
        };

        if !entries.is_empty() {
            tracing::info!(group, consumer, count = entries.len(), "redelivering pending entries");
        }
        for entry in entries {
            if self.cancel.is_cancelled() {
                return;
            }
            self.shared.stats.record_delivered(true);
            self.process(entry).await;
        }
    }

    async fn process(&self, entry: LogEntry) {
        let entry_id = entry.id;
        match self.handle(&entry).await {
            Handled::Done => self.ack(entry).await,
            Handled::Interrupted => {
                tracing::info!(
                    entry_id = %entry_id,
                    "stopped mid-task, entry left pending for redelivery"
                );
            }
        }
    }

    async fn handle(&self, entry: &LogEntry) -> Handled {
        let task = match Task::decode(&entry.payload) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(entry_id = %entry.id, error = %e, "undecodable task entry");
                self.shared.stats.record_decode_failure();
                self.record(TaskFailure {
                    entry_id: entry.id,
                    task_id: None,
                    failed_at: Clock::global().now(),
                    reason: FailureReason::Undecodable(e.to_string()),
                });
                return Handled::Done;
            }
        };

        let mut failures = Vec::new();
        for (index, step) in task.steps.iter().enumerate() {
            if index > 0 && self.cancel.is_cancelled() {
                return Handled::Interrupted;
            }

            self.shared.stats.record_step();
            match self.registry.dispatch(step).await {
                Ok(()) => tracing::debug!(
                    task_id = %task.id,
                    action = %step.action,
                    target = %step.target_id,
                    "step done"
                ),
                Err(e) => failures.push(StepFailure {
                    index,
                    target_id: step.target_id.clone(),
                    action: step.action.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            }
        }

        if failures.is_empty() {
            self.shared.stats.record_succeeded();
            tracing::debug!(task_id = %task.id, entry_id = %entry.id, "task done");
        } else {
            self.shared.stats.record_failed();
            let failure = TaskFailure {
                entry_id: entry.id,
                task_id: Some(task.id),
                failed_at: Clock::global().now(),
                reason: FailureReason::Steps(failures),
            };
            tracing::warn!(
                task_id = %task.id,
                entry_id = %entry.id,
                delivery = entry.delivery_count,
                error = %failure,
                "task finished with failed steps"
            );
            self.record(failure);
        }
        Handled::Done
    }

    async fn ack(&self, entry: LogEntry) {
        match self.stream.ack(&self.config.group, entry.id).await {
            Ok(_) => self.shared.stats.record_acked(),
            Err(e) => tracing::error!(entry_id = %entry.id, error = %e, "failed to acknowledge entry"),
        }
    }

    fn record(&self, failure: TaskFailure) {
        self.shared.failures.lock().push(failure);
    }
}
