//! Per-operation cancellation and deadlines.

use crate::error::{CoreError, CoreResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token and optional deadline carried by every operation.
///
/// The in-flight backend call is raced against both; whichever fires first
/// abandons the call with [`CoreError::Cancelled`] or
/// [`CoreError::DeadlineExceeded`]. An abandoned call may or may not have
/// taken effect on the backend.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A context bound to `cancel`.
    #[must_use]
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Returns a copy that also expires after `timeout`.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns a copy that also expires at `deadline`. An earlier existing
    /// deadline wins.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    /// Returns a context whose token is a child of this one: cancelling the
    /// parent cancels the child, not the other way round.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    /// The cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancels this context and every child.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fails fast if the context is already done.
    pub fn check(&self) -> CoreResult<()> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(CoreError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Runs `fut` to completion unless the context is cancelled or its
    /// deadline passes first.
    pub async fn run<F, T, E>(&self, fut: F) -> CoreResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<CoreError>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(CoreError::Cancelled),
            () = deadline => Err(CoreError::DeadlineExceeded),
            result = fut => result.map_err(Into::into),
        }
    }

    /// Sleeps for `duration`, waking early with an error on cancellation or
    /// deadline.
    pub async fn sleep(&self, duration: Duration) -> CoreResult<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok::<_, CoreError>(())
        })
        .await
    }
}
