//! In-memory log stream.

use crate::error::{StorageError, StorageResult};
use crate::log::{EntryId, LogEntry, LogStream, PendingEntry};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

/// Default retention limit for callers that do not pick their own.
pub const DEFAULT_MAX_LEN: usize = 1000;

#[derive(Debug)]
struct Delivery {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct Group {
    /// Last entry handed out by `read_next`. `None` means nothing yet.
    last_delivered: Option<EntryId>,
    pending: BTreeMap<EntryId, Delivery>,
}

#[derive(Debug, Default)]
struct State {
    entries: VecDeque<(EntryId, Vec<u8>)>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
    closed: bool,
}

impl State {
    fn payload(&self, id: EntryId) -> Option<&Vec<u8>> {
        // Entries are sorted by id, so a binary search finds the slot.
        self.entries
            .binary_search_by_key(&id, |(entry_id, _)| *entry_id)
            .ok()
            .map(|index| &self.entries[index].1)
    }

    fn group_mut(&mut self, group: &str) -> StorageResult<&mut Group> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| StorageError::GroupNotFound(group.to_string()))
    }
}

/// An in-memory, capped log stream with consumer groups.
///
/// Mirrors the semantics of a networked stream (capped append log, group
/// cursor, pending-entries list) for tests and single-process deployments.
/// Sharing one `InMemoryLogStream` between two queue instances models a
/// process restart against a surviving transport.
///
/// # Retention
///
/// Each append trims the stream to the `max_len` it was given, evicting the
/// oldest entries. An evicted entry that was still pending is dropped from
/// the pending list as well, since its payload can no longer be redelivered.
#[derive(Debug, Default)]
pub struct InMemoryLogStream {
    state: Mutex<State>,
    appended: Notify,
}

impl InMemoryLogStream {
    /// Creates an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the stream. Blocked readers wake up and every operation fails
    /// with `Closed` from now on.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.appended.notify_waiters();
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    fn open_state(&self) -> StorageResult<parking_lot::MutexGuard<'_, State>> {
        let state = self.state.lock();
        if state.closed {
            return Err(StorageError::Closed);
        }
        Ok(state)
    }

    fn try_deliver(&self, group: &str, consumer: &str) -> StorageResult<Option<LogEntry>> {
        let mut state = self.open_state()?;
        let cursor = state.group_mut(group)?.last_delivered;

        let next = state
            .entries
            .iter()
            .find(|(id, _)| cursor.map_or(true, |c| *id > c))
            .map(|(id, payload)| (*id, payload.clone()));

        let Some((id, payload)) = next else {
            return Ok(None);
        };

        let group = state.group_mut(group)?;
        group.last_delivered = Some(id);
        group.pending.insert(
            id,
            Delivery {
                consumer: consumer.to_string(),
                delivered_at: Instant::now(),
                delivery_count: 1,
            },
        );

        Ok(Some(LogEntry {
            id,
            payload,
            delivery_count: 1,
        }))
    }
}

#[async_trait]
impl LogStream for InMemoryLogStream {
    async fn ensure_group(&self, group: &str) -> StorageResult<()> {
        let mut state = self.open_state()?;
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn append(&self, payload: Vec<u8>, max_len: usize) -> StorageResult<EntryId> {
        let max_len = max_len.max(1);
        let id = {
            let mut state = self.open_state()?;
            let id = state.last_id.successor(Self::now_millis());
            state.last_id = id;
            state.entries.push_back((id, payload));

            while state.entries.len() > max_len {
                if let Some((evicted, _)) = state.entries.pop_front() {
                    for (name, group) in &mut state.groups {
                        if group.pending.remove(&evicted).is_some() {
                            tracing::warn!(
                                group = %name,
                                entry_id = %evicted,
                                "evicted an entry that was still pending"
                            );
                        }
                    }
                }
            }
            id
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_next(&self, group: &str, consumer: &str) -> StorageResult<LogEntry> {
        loop {
            // Register for wakeups before checking, so an append racing the
            // check is never missed.
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(entry) = self.try_deliver(group, consumer)? {
                return Ok(entry);
            }

            appended.await;
        }
    }

    async fn redeliver_pending(
        &self,
        group: &str,
        consumer: &str,
    ) -> StorageResult<Vec<LogEntry>> {
        let mut state = self.open_state()?;
        let now = Instant::now();

        let ids: Vec<EntryId> = state
            .group_mut(group)?
            .pending
            .iter()
            .filter(|(_, delivery)| delivery.consumer == consumer)
            .map(|(id, _)| *id)
            .collect();

        let mut redelivered = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(payload) = state.payload(id).cloned() else {
                continue;
            };
            let group = state.group_mut(group)?;
            if let Some(delivery) = group.pending.get_mut(&id) {
                delivery.delivery_count += 1;
                delivery.delivered_at = now;
                redelivered.push(LogEntry {
                    id,
                    payload,
                    delivery_count: delivery.delivery_count,
                });
            }
        }

        Ok(redelivered)
    }

    async fn ack(&self, group: &str, id: EntryId) -> StorageResult<bool> {
        let mut state = self.open_state()?;
        Ok(state.group_mut(group)?.pending.remove(&id).is_some())
    }

    async fn pending(&self, group: &str) -> StorageResult<Vec<PendingEntry>> {
        let mut state = self.open_state()?;
        let now = Instant::now();
        Ok(state
            .group_mut(group)?
            .pending
            .iter()
            .map(|(id, delivery)| PendingEntry {
                id: *id,
                consumer: delivery.consumer.clone(),
                idle: now.saturating_duration_since(delivery.delivered_at),
                delivery_count: delivery.delivery_count,
            })
            .collect())
    }

    async fn len(&self) -> StorageResult<usize> {
        Ok(self.open_state()?.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const GROUP: &str = "tasks";

    async fn stream() -> InMemoryLogStream {
        let stream = InMemoryLogStream::new();
        stream.ensure_group(GROUP).await.unwrap();
        stream
    }

    #[tokio::test]
    async fn ids_increase_in_append_order() {
        let stream = stream().await;
        let a = stream.append(vec![1], DEFAULT_MAX_LEN).await.unwrap();
        let b = stream.append(vec![2], DEFAULT_MAX_LEN).await.unwrap();
        let c = stream.append(vec![3], DEFAULT_MAX_LEN).await.unwrap();
        assert!(a < b && b < c);
        assert_eq!(stream.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn read_next_delivers_in_order_and_tracks_pending() {
        let stream = stream().await;
        let a = stream.append(vec![1], DEFAULT_MAX_LEN).await.unwrap();
        let b = stream.append(vec![2], DEFAULT_MAX_LEN).await.unwrap();

        let first = stream.read_next(GROUP, "c1").await.unwrap();
        let second = stream.read_next(GROUP, "c1").await.unwrap();
        assert_eq!((first.id, first.payload), (a, vec![1]));
        assert_eq!((second.id, second.payload), (b, vec![2]));

        let pending = stream.pending(GROUP).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].consumer, "c1");
        assert_eq!(pending[0].delivery_count, 1);

        assert!(stream.ack(GROUP, a).await.unwrap());
        assert!(!stream.ack(GROUP, a).await.unwrap());
        assert_eq!(stream.pending(GROUP).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn group_created_late_sees_existing_entries() {
        let stream = InMemoryLogStream::new();
        stream.append(vec![9], DEFAULT_MAX_LEN).await.unwrap();
        stream.ensure_group(GROUP).await.unwrap();

        let entry = stream.read_next(GROUP, "c1").await.unwrap();
        assert_eq!(entry.payload, vec![9]);
    }

    #[tokio::test]
    async fn unknown_group_fails() {
        let stream = InMemoryLogStream::new();
        let result = stream.pending("missing").await;
        assert!(matches!(result, Err(StorageError::GroupNotFound(_))));
    }

    #[tokio::test]
    async fn read_next_waits_for_append() {
        let stream = Arc::new(stream().await);

        let reader = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.read_next(GROUP, "c1").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        stream.append(vec![7], DEFAULT_MAX_LEN).await.unwrap();
        let entry = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(entry.payload, vec![7]);
    }

    #[tokio::test]
    async fn redeliver_bumps_delivery_count() {
        let stream = stream().await;
        let id = stream.append(vec![1], DEFAULT_MAX_LEN).await.unwrap();
        stream.read_next(GROUP, "c1").await.unwrap();

        let again = stream.redeliver_pending(GROUP, "c1").await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, id);
        assert_eq!(again[0].delivery_count, 2);

        assert!(stream.redeliver_pending(GROUP, "c2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn eviction_caps_length_and_pending() {
        let stream = stream().await;

        let first = stream.append(vec![1], 2).await.unwrap();
        stream.read_next(GROUP, "c1").await.unwrap();
        stream.append(vec![2], 2).await.unwrap();
        stream.append(vec![3], 2).await.unwrap();

        assert_eq!(stream.len().await.unwrap(), 2);
        let pending = stream.pending(GROUP).await.unwrap();
        assert!(pending.iter().all(|p| p.id != first));

        let next = stream.read_next(GROUP, "c1").await.unwrap();
        assert_eq!(next.payload, vec![2]);
    }

    #[tokio::test]
    async fn close_wakes_blocked_reader() {
        let stream = Arc::new(stream().await);
        let reader = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move { stream.read_next(GROUP, "c1").await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.close();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(StorageError::Closed)));
    }
}
