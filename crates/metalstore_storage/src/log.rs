//! Log stream trait and entry types.
//!
//! A log stream is an append-only, capped sequence of opaque payloads read
//! through consumer groups. Each group keeps a delivery cursor and a list of
//! pending entries: delivered to one of its consumers but not yet
//! acknowledged.
//!
//! ## Delivery Model
//!
//! ```text
//!   append ──► [ e1 | e2 | e3 | e4 ]       (oldest evicted past max_len)
//!                     ▲
//!                     └── group cursor: next never-delivered entry
//!
//!   read_next  ──► deliver e3, add e3 to pending(consumer)
//!   ack(e3)    ──► remove e3 from pending
//!   redeliver_pending ──► hand e3 out again if it was never acked
//! ```

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Identifier of a log entry.
///
/// Ids are `<millis>-<seq>` pairs: the append wall-clock time in
/// milliseconds plus a sequence number that disambiguates appends within the
/// same millisecond. Ids are strictly increasing in append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    /// Milliseconds since the Unix epoch at append time.
    pub millis: u64,
    /// Sequence within `millis`.
    pub seq: u64,
}

impl EntryId {
    /// Creates an entry id.
    #[must_use]
    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Returns the smallest id strictly greater than `self` for a clock
    /// reading of `now_millis`.
    #[must_use]
    pub fn successor(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| StorageError::codec(format!("malformed entry id: {s}")))?;
        let millis = millis
            .parse()
            .map_err(|_| StorageError::codec(format!("malformed entry id: {s}")))?;
        let seq = seq
            .parse()
            .map_err(|_| StorageError::codec(format!("malformed entry id: {s}")))?;
        Ok(Self::new(millis, seq))
    }
}

/// An entry handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Entry id.
    pub id: EntryId,
    /// Opaque payload as appended.
    pub payload: Vec<u8>,
    /// How many times this entry has been delivered, this delivery included.
    pub delivery_count: u32,
}

/// A delivered but unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Entry id.
    pub id: EntryId,
    /// Consumer that holds the entry.
    pub consumer: String,
    /// Time since the entry was last delivered.
    pub idle: Duration,
    /// Number of deliveries so far.
    pub delivery_count: u32,
}

/// An append-only log read through consumer groups.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`. Appends may come from any task
/// while a consumer is blocked in [`read_next`](LogStream::read_next).
#[async_trait]
pub trait LogStream: Send + Sync {
    /// Creates the consumer group if it does not exist. Idempotent.
    ///
    /// A new group starts before the oldest retained entry, so entries
    /// appended before the group existed are still delivered.
    async fn ensure_group(&self, group: &str) -> StorageResult<()>;

    /// Appends a payload and returns its id.
    ///
    /// Returns once the append is acknowledged by the stream. If the stream
    /// holds more than `max_len` entries afterwards, the oldest are evicted.
    async fn append(&self, payload: Vec<u8>, max_len: usize) -> StorageResult<EntryId>;

    /// Delivers the next entry the group has never delivered, waiting as
    /// long as necessary for one to be appended.
    ///
    /// The entry becomes pending for `consumer` until acknowledged.
    /// Cancellation is the caller's concern: dropping the future abandons
    /// the wait without delivering anything.
    async fn read_next(&self, group: &str, consumer: &str) -> StorageResult<LogEntry>;

    /// Delivers again every entry pending for `consumer`, oldest first,
    /// incrementing each delivery count.
    async fn redeliver_pending(&self, group: &str, consumer: &str)
        -> StorageResult<Vec<LogEntry>>;

    /// Acknowledges an entry, removing it from the group's pending list.
    ///
    /// Returns `false` if the entry was not pending.
    async fn ack(&self, group: &str, id: EntryId) -> StorageResult<bool>;

    /// Lists the group's pending entries in id order.
    async fn pending(&self, group: &str) -> StorageResult<Vec<PendingEntry>>;

    /// Returns the number of retained entries.
    async fn len(&self) -> StorageResult<usize>;

    /// Returns true if no entries are retained.
    async fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len().await? == 0)
    }
}
