//! Error types for metalstore core.

use metalstore_storage::StorageError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse classification every [`CoreError`] maps onto.
///
/// Callers branch on the kind, not on individual variants: `Conflict` means
/// "re-read and retry", `NotFound` means "absent", `InvalidArgument` means
/// "the request itself is wrong" and `Internal` covers everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The addressed record or value does not exist.
    NotFound,
    /// A concurrent writer got there first.
    Conflict,
    /// The request was malformed or out of range.
    InvalidArgument,
    /// Anything else: backend failures, exhaustion, cancellation.
    Internal,
}

/// Errors that can occur in metalstore core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The addressed record or value does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// What was missing.
        message: String,
    },

    /// Optimistic concurrency or allocation race lost.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// The caller passed an invalid argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of what was wrong.
        message: String,
    },

    /// A lookup that must match exactly one record matched several.
    #[error("more than one exists in collection {collection}")]
    MoreThanOne {
        /// Collection searched.
        collection: String,
    },

    /// A task step named an action kind with no registered handler.
    #[error("unimplemented action: {action}")]
    UnknownAction {
        /// The unregistered action kind.
        action: String,
    },

    /// A migration failed to apply.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },

    /// Encoding or decoding a document or payload failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation's deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Other internal failure.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },

    /// Several errors collected together.
    #[error("{} errors: {}", .0.len(), join_messages(.0))]
    Multiple(Vec<CoreError>),

    /// Storage backend error with no more specific mapping.
    #[error("storage error: {0}")]
    Storage(StorageError),
}

fn join_messages(errors: &[CoreError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CoreError {
    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Creates an unknown action error.
    pub fn unknown_action(action: impl Into<String>) -> Self {
        Self::UnknownAction {
            action: action.into(),
        }
    }

    /// Joins several errors into one. Returns `None` for an empty list and
    /// the error itself for a single-element list.
    #[must_use]
    pub fn join(mut errors: Vec<CoreError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }

    /// Returns the coarse kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::MoreThanOne { .. }
            | Self::UnknownAction { .. }
            | Self::MigrationFailed { .. }
            | Self::Codec { .. }
            | Self::Cancelled
            | Self::DeadlineExceeded
            | Self::Internal { .. }
            | Self::Multiple(_)
            | Self::Storage(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if the error is of kind `NotFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns true if the error is of kind `Conflict`.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Returns true if the error is of kind `InvalidArgument`.
    #[must_use]
    pub fn is_invalid_argument(&self) -> bool {
        self.kind() == ErrorKind::InvalidArgument
    }

    /// Returns true if re-reading and retrying may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_conflict()
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => Self::not_found(err.to_string()),
            StorageError::AlreadyExists { .. } | StorageError::GuardFailed { .. } => {
                Self::conflict(err.to_string())
            }
            StorageError::Codec(message) => Self::codec(message),
            other => Self::Storage(other),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::codec(err.to_string())
    }
}
