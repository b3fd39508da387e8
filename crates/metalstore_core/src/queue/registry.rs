//! Action handlers keyed by action kind.

use crate::error::{CoreError, CoreResult};
use crate::queue::task::{ActionKind, Step};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Executes one kind of deferred action.
///
/// Handlers may run more than once for the same step (after a restart, for
/// instance) and should be idempotent: releasing something already released
/// is a success.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Runs the action for one step.
    async fn handle(&self, step: &Step) -> CoreResult<()>;
}

#[async_trait]
impl<F, Fut> ActionHandler for F
where
    F: Fn(Step) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CoreResult<()>> + Send + 'static,
{
    async fn handle(&self, step: &Step) -> CoreResult<()> {
        (self)(step.clone()).await
    }
}

/// The set of actions a task queue can execute.
///
/// Built before the queue starts and moved into it.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `kind` already has a handler.
    pub fn register(
        &mut self,
        kind: impl Into<ActionKind>,
        handler: impl ActionHandler + 'static,
    ) -> CoreResult<()> {
        let kind = kind.into();
        if self.handlers.contains_key(&kind) {
            return Err(CoreError::invalid_argument(format!(
                "action {kind} already registered"
            )));
        }
        self.handlers.insert(kind, Arc::new(handler));
        Ok(())
    }

    /// Returns the handler for `kind`.
    #[must_use]
    pub fn get(&self, kind: &ActionKind) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Returns true if `kind` has a handler.
    #[must_use]
    pub fn contains(&self, kind: &ActionKind) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<ActionKind> {
        let mut kinds: Vec<_> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Number of registered kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler registered for the step's action.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownAction`] if no handler is registered, otherwise
    /// whatever the handler returns.
    pub async fn dispatch(&self, step: &Step) -> CoreResult<()> {
        let handler = self
            .get(&step.action)
            .ok_or_else(|| CoreError::unknown_action(step.action.as_str()))?;
        handler.handle(step).await
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
