//! Tasks, steps and their log encoding.

use crate::clock::Clock;
use crate::entity::EntityId;
use crate::error::{CoreError, CoreResult, ErrorKind};
use chrono::{DateTime, Utc};
use metalstore_storage::EntryId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Name of a deferred action, for example `"release"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionKind(String);

impl ActionKind {
    /// Creates an action kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// Returns the kind as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl From<String> for ActionKind {
    fn from(kind: String) -> Self {
        Self(kind)
    }
}

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new random task id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One action applied to one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Id of the record the action applies to.
    pub target_id: EntityId,
    /// Action to run.
    pub action: ActionKind,
    /// Optional action arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl Step {
    /// Creates a step without arguments.
    pub fn new(target_id: impl Into<EntityId>, action: impl Into<ActionKind>) -> Self {
        Self {
            target_id: target_id.into(),
            action: action.into(),
            args: None,
        }
    }

    /// Attaches arguments.
    #[must_use]
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }
}

/// An ordered list of steps executed together by the queue worker.
///
/// Tasks are immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier.
    pub id: TaskId,
    /// When the task was built.
    pub enqueued_at: DateTime<Utc>,
    /// Steps in execution order.
    pub steps: Vec<Step>,
}

#[derive(Deserialize)]
struct Envelope {
    task: Task,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    task: &'a Task,
}

impl Task {
    /// Creates a task from steps.
    #[must_use]
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            id: TaskId::generate(),
            enqueued_at: Clock::global().now(),
            steps,
        }
    }

    /// Creates a single-step task.
    pub fn single(target_id: impl Into<EntityId>, action: impl Into<ActionKind>) -> Self {
        Self::new(vec![Step::new(target_id, action)])
    }

    /// Appends a step.
    #[must_use]
    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Encodes the task as the CBOR log payload `{ "task": ... }`.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(
            &EnvelopeRef { task: self },
            &mut buf,
        )
        .map_err(|e| CoreError::codec(format!("encoding task {}: {e}", self.id)))?;
        Ok(buf)
    }

    /// Decodes a CBOR log payload.
    pub fn decode(payload: &[u8]) -> CoreResult<Self> {
        let envelope: Envelope = ciborium::from_reader(payload)
            .map_err(|e| CoreError::codec(format!("decoding task payload: {e}")))?;
        Ok(envelope.task)
    }
}

/// One failed step of a processed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Position of the step within the task.
    pub index: usize,
    /// Step target.
    pub target_id: EntityId,
    /// Step action.
    pub action: ActionKind,
    /// Kind of the handler error.
    pub kind: ErrorKind,
    /// Handler error message.
    pub message: String,
}

/// Why a log entry was recorded as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// One or more steps failed; the others ran.
    Steps(Vec<StepFailure>),
    /// The payload could not be decoded into a task.
    Undecodable(String),
}

/// A processed log entry that did not fully succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Log entry the task was read from.
    pub entry_id: EntryId,
    /// Task id, unknown for undecodable payloads.
    pub task_id: Option<TaskId>,
    /// When processing finished.
    pub failed_at: DateTime<Utc>,
    /// What went wrong.
    pub reason: FailureReason,
}

impl TaskFailure {
    /// Converts the failure into an error for aggregation.
    #[must_use]
    pub fn to_error(&self) -> CoreError {
        CoreError::internal(self.to_string())
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.reason, self.task_id) {
            (FailureReason::Undecodable(message), _) => {
                write!(f, "entry {}: undecodable payload: {message}", self.entry_id)
            }
            (FailureReason::Steps(steps), task_id) => {
                write!(f, "entry {}", self.entry_id)?;
                if let Some(task_id) = task_id {
                    write!(f, " task {task_id}")?;
                }
                for step in steps {
                    write!(
                        f,
                        "; step {} {}({}): {}",
                        step.index, step.action, step.target_id, step.message
                    )?;
                }
                Ok(())
            }
        }
    }
}
