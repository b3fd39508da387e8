//! Strictly monotonic timestamp source.
//!
//! The `changed` timestamp is the only optimistic-concurrency token, so two
//! writes must never observe the same instant. [`Clock::now`] hands out UTC
//! timestamps at nanosecond resolution and bumps by one nanosecond whenever
//! the wall clock has not advanced (or has gone backwards) since the last
//! reading.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::OnceLock;

/// A strictly monotonic UTC clock.
#[derive(Debug, Default)]
pub struct Clock {
    last_nanos: Mutex<i64>,
}

impl Clock {
    /// Creates an independent clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide clock shared by every store.
    pub fn global() -> &'static Clock {
        static GLOBAL: OnceLock<Clock> = OnceLock::new();
        GLOBAL.get_or_init(Clock::new)
    }

    /// Returns a timestamp strictly greater than every one this clock has
    /// returned before.
    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = self.last_nanos.lock();
        let next = if wall > *last { wall } else { *last + 1 };
        *last = next;
        DateTime::from_timestamp_nanos(next)
    }
}
