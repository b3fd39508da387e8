//! Task queue counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Worker counters.
///
/// All counters are atomic and can be read while the worker runs. Values
/// only ever increase.
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Log entries handed to the worker, redeliveries included.
    delivered: AtomicU64,
    /// Entries redelivered after a restart.
    redelivered: AtomicU64,
    /// Tasks whose steps all succeeded.
    succeeded: AtomicU64,
    /// Tasks with at least one failed step.
    failed: AtomicU64,
    /// Payloads that could not be decoded.
    decode_failures: AtomicU64,
    /// Entries acknowledged.
    acked: AtomicU64,
    /// Steps executed, failed ones included.
    steps: AtomicU64,
}

impl QueueStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_delivered(&self, redelivery: bool) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if redelivery {
            self.redelivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_step(&self) {
        self.steps.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            steps: self.steps.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatsSnapshot {
    /// Log entries handed to the worker, redeliveries included.
    pub delivered: u64,
    /// Entries redelivered after a restart.
    pub redelivered: u64,
    /// Tasks whose steps all succeeded.
    pub succeeded: u64,
    /// Tasks with at least one failed step.
    pub failed: u64,
    /// Payloads that could not be decoded.
    pub decode_failures: u64,
    /// Entries acknowledged.
    pub acked: u64,
    /// Steps executed, failed ones included.
    pub steps: u64,
}

impl QueueStatsSnapshot {
    /// Entries fully handled, whatever their outcome.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.succeeded + self.failed + self.decode_failures
    }
}
