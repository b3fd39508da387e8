//! Pool, queue and retry configuration.

use crate::error::{CoreError, CoreResult};
use rand::Rng;
use std::time::Duration;

/// Backoff policy for retrying lost races.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to each delay.
    pub add_jitter: bool,
}

impl RetryPolicy {
    /// Creates a policy allowing `max_attempts` attempts.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns the delay before attempt `attempt` (0-indexed). Attempt 0
    /// never waits.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter && capped > 0.0 {
            let jitter = capped * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(capped + jitter)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Configuration of an integer pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Pool name. Also names the slot collection and, with an `_info`
    /// suffix, the marker collection.
    pub name: String,
    /// Smallest allocatable value, inclusive.
    pub min: u32,
    /// Largest allocatable value, inclusive.
    pub max: u32,
    /// Retry policy for `acquire_random` races.
    pub retry: RetryPolicy,
}

impl PoolConfig {
    /// Largest number of slots a pool may hold.
    pub const MAX_RANGE: u64 = 1 << 20;

    /// Creates a pool configuration with the default retry policy.
    pub fn new(name: impl Into<String>, min: u32, max: u32) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Number of integers in `[min, max]`.
    #[must_use]
    pub fn size(&self) -> u64 {
        u64::from(self.max).saturating_sub(u64::from(self.min)) + 1
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the name is empty, `min > max`, or the range is
    /// larger than [`Self::MAX_RANGE`].
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::invalid_argument("pool name must not be empty"));
        }
        if self.min > self.max {
            return Err(CoreError::invalid_argument(format!(
                "pool {}: min {} is greater than max {}",
                self.name, self.min, self.max
            )));
        }
        if self.size() > Self::MAX_RANGE {
            return Err(CoreError::invalid_argument(format!(
                "pool {}: range of {} values exceeds the limit of {}",
                self.name,
                self.size(),
                Self::MAX_RANGE
            )));
        }
        Ok(())
    }
}

/// Configuration of a task queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Consumer group name on the log stream.
    pub group: String,
    /// Consumer name within the group.
    pub consumer: String,
    /// Retention limit of the log.
    pub max_len: usize,
    /// Whether to reprocess this consumer's unacknowledged entries on start.
    pub redeliver_on_start: bool,
}

impl QueueConfig {
    /// Creates a configuration for `group` and `consumer` with defaults.
    pub fn new(group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            max_len: metalstore_storage::DEFAULT_MAX_LEN,
            redeliver_on_start: true,
        }
    }

    /// Sets the retention limit.
    #[must_use]
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Sets whether pending entries are redelivered on start.
    #[must_use]
    pub fn redeliver_on_start(mut self, value: bool) -> Self {
        self.redeliver_on_start = value;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new("tasks", "worker-0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_never_waits() {
        assert_eq!(RetryPolicy::default().delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::new(10)
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50))
            .with_jitter(false);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_millis(50));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = RetryPolicy::new(10)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(100));
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn pool_config_validation() {
        assert!(PoolConfig::new("vrf", 1, 131_072).validate().is_ok());
        assert!(PoolConfig::new("vrf", 5, 5).validate().is_ok());

        let err = PoolConfig::new("vrf", 10, 1).validate().unwrap_err();
        assert!(err.is_invalid_argument());

        let err = PoolConfig::new("asn", 0, u32::MAX).validate().unwrap_err();
        assert!(err.is_invalid_argument());

        assert!(PoolConfig::new("", 1, 2).validate().is_err());
    }

    #[test]
    fn queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_len, 1000);
        assert!(config.redeliver_on_start);

        let config = QueueConfig::new("g", "c").max_len(5).redeliver_on_start(false);
        assert_eq!(config.max_len, 5);
        assert!(!config.redeliver_on_start);
    }
}
