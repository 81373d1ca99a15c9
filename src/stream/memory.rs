//! In-process durable log with consumer-group semantics.
//!
//! Mirrors the Redis Streams behaviour the workers rely on: `>` reads,
//! a per-group pending set with owner/idle/delivery-count bookkeeping,
//! idle-gated claims and idempotent acks. All group mutations happen under
//! one lock, which makes every claim and ack atomic per entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::clock::{elapsed_between, Clock, SystemClock};
use crate::error::StreamError;
use crate::scheduler::WorkItem;

use super::{
    dead_letter_key, DurableLog, EntryId, PendingEntryInfo, PendingSummary, StreamEntry,
};

type Fields = HashMap<String, String>;

#[derive(Debug)]
struct PendingRecord {
    owner: String,
    last_delivery: DateTime<Utc>,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Last entry delivered to the group with `>` semantics.
    cursor: EntryId,
    pending: BTreeMap<EntryId, PendingRecord>,
}

#[derive(Debug, Default)]
struct LogState {
    last_id: EntryId,
    entries: BTreeMap<EntryId, Fields>,
    groups: HashMap<String, GroupState>,
    last_dead_id: EntryId,
    dead_letters: BTreeMap<EntryId, Fields>,
}

/// Durable log kept in process memory.
pub struct MemoryLog {
    stream: String,
    dead_letter_stream: String,
    clock: Arc<dyn Clock>,
    state: Mutex<LogState>,
    appended: Notify,
}

impl MemoryLog {
    /// Creates an empty log driven by the system clock.
    pub fn new(stream: impl Into<String>) -> Self {
        Self::with_clock(stream, Arc::new(SystemClock))
    }

    /// Creates an empty log that reads time from `clock`.
    pub fn with_clock(stream: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let stream = stream.into();
        Self {
            dead_letter_stream: dead_letter_key(&stream),
            stream,
            clock,
            state: Mutex::new(LogState::default()),
            appended: Notify::new(),
        }
    }

    /// Key of the paired dead-letter stream.
    pub fn dead_letter_stream(&self) -> &str {
        &self.dead_letter_stream
    }

    /// Raw fields of every dead-lettered entry, oldest first.
    pub fn dead_letters(&self) -> Vec<HashMap<String, String>> {
        self.state().dead_letters.values().cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now_millis(&self) -> u64 {
        self.clock.now().timestamp_millis().max(0) as u64
    }

    fn no_group(&self, group: &str) -> StreamError {
        StreamError::NoGroup {
            stream: self.stream.clone(),
            group: group.to_string(),
        }
    }

    fn push(state: &mut LogState, now_millis: u64, item: &WorkItem) -> EntryId {
        let id = state.last_id.next_after(now_millis);
        state.last_id = id;
        let fields = item
            .to_fields()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        state.entries.insert(id, fields);
        id
    }

    /// Hands the next unseen entries to `consumer` and records them as pending.
    fn deliver(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let now = self.clock.now();
        let mut guard = self.state();
        let state = &mut *guard;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| self.no_group(group))?;

        let fresh: Vec<(EntryId, Fields)> = state
            .entries
            .range(group_state.cursor..)
            .filter(|(id, _)| **id > group_state.cursor)
            .take(max_count.max(1))
            .map(|(id, fields)| (*id, fields.clone()))
            .collect();

        let mut delivered = Vec::with_capacity(fresh.len());
        for (id, fields) in fresh {
            group_state.cursor = id;
            group_state.pending.insert(
                id,
                PendingRecord {
                    owner: consumer.to_string(),
                    last_delivery: now,
                    delivery_count: 1,
                },
            );
            delivered.push(StreamEntry {
                id,
                fields,
                delivery_count: 1,
                owner: consumer.to_string(),
                last_delivery: now,
            });
        }

        Ok(delivered)
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    fn stream(&self) -> &str {
        &self.stream
    }

    async fn ensure_group(&self, group: &str) -> Result<bool, StreamError> {
        let mut state = self.state();
        if state.groups.contains_key(group) {
            return Ok(false);
        }
        state.groups.insert(group.to_string(), GroupState::default());
        Ok(true)
    }

    async fn append(&self, item: &WorkItem) -> Result<EntryId, StreamError> {
        let now_millis = self.now_millis();
        let id = Self::push(&mut self.state(), now_millis, item);
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn append_bulk(&self, items: &[WorkItem]) -> Result<Vec<EntryId>, StreamError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let now_millis = self.now_millis();
        let ids = {
            let mut state = self.state();
            items
                .iter()
                .map(|item| Self::push(&mut state, now_millis, item))
                .collect()
        };
        self.appended.notify_waiters();
        Ok(ids)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let deadline = tokio::time::Instant::now() + block;

        loop {
            // Register interest before looking, so an append between the
            // check and the wait is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.deliver(group, consumer, max_count)?;
            if !batch.is_empty() || block.is_zero() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn pending_summary(&self, group: &str) -> Result<PendingSummary, StreamError> {
        let state = self.state();
        let group_state = state.groups.get(group).ok_or_else(|| self.no_group(group))?;
        Ok(PendingSummary {
            count: group_state.pending.len() as u64,
        })
    }

    async fn pending_detail(
        &self,
        group: &str,
        start: EntryId,
        end: EntryId,
        max_count: usize,
    ) -> Result<Vec<PendingEntryInfo>, StreamError> {
        if start > end {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let state = self.state();
        let group_state = state.groups.get(group).ok_or_else(|| self.no_group(group))?;

        Ok(group_state
            .pending
            .range(start..=end)
            .take(max_count)
            .map(|(id, record)| PendingEntryInfo {
                id: *id,
                owner: record.owner.clone(),
                delivery_count: record.delivery_count,
                idle: elapsed_between(record.last_delivery, now),
            })
            .collect())
    }

    async fn claim(
        &self,
        group: &str,
        new_owner: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let now = self.clock.now();
        let mut guard = self.state();
        let state = &mut *guard;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| self.no_group(group))?;

        let mut claimed = Vec::new();
        for id in ids {
            let Some(record) = group_state.pending.get_mut(id) else {
                continue;
            };
            if elapsed_between(record.last_delivery, now) < min_idle {
                continue;
            }
            let Some(fields) = state.entries.get(id) else {
                continue;
            };

            record.owner = new_owner.to_string();
            record.last_delivery = now;
            record.delivery_count += 1;

            claimed.push(StreamEntry {
                id: *id,
                fields: fields.clone(),
                delivery_count: record.delivery_count,
                owner: record.owner.clone(),
                last_delivery: now,
            });
        }

        Ok(claimed)
    }

    async fn ack(&self, group: &str, id: EntryId) -> Result<bool, StreamError> {
        let mut state = self.state();
        Ok(state
            .groups
            .get_mut(group)
            .map(|g| g.pending.remove(&id).is_some())
            .unwrap_or(false))
    }

    async fn dead_letter(
        &self,
        group: &str,
        entry: &StreamEntry,
        reason: &str,
    ) -> Result<EntryId, StreamError> {
        let now_millis = self.now_millis();
        let mut guard = self.state();
        let state = &mut *guard;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| self.no_group(group))?;

        let mut fields = entry.fields.clone();
        fields.insert("entry_id".to_string(), entry.id.to_string());
        fields.insert("reason".to_string(), reason.to_string());
        fields.insert("deliveries".to_string(), entry.delivery_count.to_string());

        let dead_id = state.last_dead_id.next_after(now_millis);
        state.last_dead_id = dead_id;
        state.dead_letters.insert(dead_id, fields);
        group_state.pending.remove(&entry.id);

        Ok(dead_id)
    }

    async fn stream_len(&self) -> Result<u64, StreamError> {
        Ok(self.state().entries.len() as u64)
    }

    async fn dead_letter_len(&self) -> Result<u64, StreamError> {
        Ok(self.state().dead_letters.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const GROUP: &str = "india";

    fn log_with_clock() -> (MemoryLog, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let log = MemoryLog::with_clock("uptime:test", clock.clone());
        (log, clock)
    }

    fn item(n: usize) -> WorkItem {
        WorkItem::new(format!("m{}", n), format!("https://site{}.test", n))
    }

    #[tokio::test]
    async fn test_ids_strictly_increase_within_same_millisecond() {
        let (log, _clock) = log_with_clock();
        let ids = log
            .append_bulk(&[item(1), item(2), item(3)])
            .await
            .unwrap();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let next = log.append(&item(4)).await.unwrap();
        assert!(next > ids[2]);
    }

    #[tokio::test]
    async fn test_read_group_delivers_each_entry_once() {
        let (log, _clock) = log_with_clock();
        log.ensure_group(GROUP).await.unwrap();
        log.append_bulk(&[item(1), item(2), item(3)]).await.unwrap();

        let first = log
            .read_group(GROUP, "worker-1", 2, Duration::ZERO)
            .await
            .unwrap();
        let second = log
            .read_group(GROUP, "worker-2", 10, Duration::ZERO)
            .await
            .unwrap();
        let third = log
            .read_group(GROUP, "worker-1", 10, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(third.is_empty());
        assert!(first[1].id < second[0].id);
        assert_eq!(second[0].owner, "worker-2");
        assert_eq!(second[0].delivery_count, 1);
        assert_eq!(log.pending_summary(GROUP).await.unwrap().count, 3);
    }

    #[tokio::test]
    async fn test_group_created_after_append_sees_existing_entries() {
        let (log, _clock) = log_with_clock();
        log.append(&item(1)).await.unwrap();
        assert!(log.ensure_group(GROUP).await.unwrap());
        assert!(!log.ensure_group(GROUP).await.unwrap());

        let batch = log
            .read_group(GROUP, "worker-1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_read_group_without_group_fails() {
        let (log, _clock) = log_with_clock();
        let err = log
            .read_group("missing", "worker-1", 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::NoGroup { .. }));
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let (log, _clock) = log_with_clock();
        let log = Arc::new(log);
        log.ensure_group(GROUP).await.unwrap();

        let reader = {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                log.read_group(GROUP, "worker-1", 10, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append(&item(1)).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader should wake before its block timeout")
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let (log, _clock) = log_with_clock();
        log.ensure_group(GROUP).await.unwrap();
        let batch = log
            .read_group(GROUP, "worker-1", 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_claim_requires_min_idle() {
        let (log, clock) = log_with_clock();
        log.ensure_group(GROUP).await.unwrap();
        let id = log.append(&item(1)).await.unwrap();
        log.read_group(GROUP, "worker-1", 10, Duration::ZERO)
            .await
            .unwrap();

        let early = log
            .claim(GROUP, "reclaimer", Duration::from_secs(30), &[id])
            .await
            .unwrap();
        assert!(early.is_empty());

        clock.advance(Duration::from_secs(31));
        let claimed = log
            .claim(GROUP, "reclaimer", Duration::from_secs(30), &[id])
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].owner, "reclaimer");
        assert_eq!(claimed[0].delivery_count, 2);

        let detail = log
            .pending_detail(GROUP, EntryId::MIN, EntryId::MAX, 10)
            .await
            .unwrap();
        assert_eq!(detail[0].owner, "reclaimer");
        assert_eq!(detail[0].idle, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_claim_skips_unknown_and_acked_entries() {
        let (log, clock) = log_with_clock();
        log.ensure_group(GROUP).await.unwrap();
        let id = log.append(&item(1)).await.unwrap();
        log.read_group(GROUP, "worker-1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(log.ack(GROUP, id).await.unwrap());

        clock.advance(Duration::from_secs(60));
        let claimed = log
            .claim(
                GROUP,
                "reclaimer",
                Duration::from_secs(30),
                &[id, EntryId::new(1, 1)],
            )
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let (log, _clock) = log_with_clock();
        log.ensure_group(GROUP).await.unwrap();
        let id = log.append(&item(1)).await.unwrap();
        log.read_group(GROUP, "worker-1", 10, Duration::ZERO)
            .await
            .unwrap();

        assert!(log.ack(GROUP, id).await.unwrap());
        assert!(!log.ack(GROUP, id).await.unwrap());
        assert!(!log.ack(GROUP, EntryId::new(9, 9)).await.unwrap());
        assert!(!log.ack("unknown-group", id).await.unwrap());
        assert_eq!(log.pending_summary(GROUP).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_pending_detail_respects_range_and_count() {
        let (log, _clock) = log_with_clock();
        log.ensure_group(GROUP).await.unwrap();
        let ids = log
            .append_bulk(&[item(1), item(2), item(3), item(4)])
            .await
            .unwrap();
        log.read_group(GROUP, "worker-1", 10, Duration::ZERO)
            .await
            .unwrap();

        let page = log
            .pending_detail(GROUP, ids[1], EntryId::MAX, 2)
            .await
            .unwrap();
        assert_eq!(
            page.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![ids[1], ids[2]]
        );
        assert!(log
            .pending_detail(GROUP, ids[3], ids[0], 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_moves_and_acks() {
        let (log, _clock) = log_with_clock();
        log.ensure_group(GROUP).await.unwrap();
        log.append(&item(1)).await.unwrap();
        let entry = log
            .read_group(GROUP, "worker-1", 10, Duration::ZERO)
            .await
            .unwrap()
            .remove(0);

        log.dead_letter(GROUP, &entry, "too many deliveries")
            .await
            .unwrap();

        assert_eq!(log.pending_summary(GROUP).await.unwrap().count, 0);
        assert_eq!(log.dead_letter_len().await.unwrap(), 1);
        let dead = &log.dead_letters()[0];
        assert_eq!(dead.get("entry_id"), Some(&entry.id.to_string()));
        assert_eq!(dead.get("reason").map(String::as_str), Some("too many deliveries"));
        assert_eq!(dead.get("id").map(String::as_str), Some("m1"));
        assert_eq!(log.dead_letter_stream(), "uptime:test:dead_letter");
    }
}
