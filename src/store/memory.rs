// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process stream store.
//!
//! Models the subset of Redis stream semantics the courier relies on:
//!
//! - Ids are `{ms}-{seq}` from the store's [`Clock`], strictly increasing per
//!   stream.
//! - Each consumer group tracks its last delivered id and a pending entries
//!   list (owner, delivery time, delivery count).
//! - `read_new` delivers ids above the group's last delivered id and adds
//!   them to the pending list; `claim_stale` reassigns pending entries idle
//!   for at least `min_idle`.
//! - Delay queues are sorted sets ordered by (score, member); empty ones
//!   disappear like Redis keys do.
//!
//! All state sits behind one mutex; every operation is atomic with respect
//! to every other.

use super::{BoxFuture, EntryId, StreamEntry, StreamStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{CourierError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

type Id = (u64, u64);

fn format_id(id: Id) -> String {
    format!("{}-{}", id.0, id.1)
}

#[derive(Debug, Clone)]
struct PendingEntry {
    consumer: String,
    delivered_at: u64,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: Id,
    pending: BTreeMap<Id, PendingEntry>,
    consumers: HashSet<String>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<Id, Vec<(String, String)>>,
    last_id: Id,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn entry(&self, id: Id) -> Option<StreamEntry> {
        self.entries
            .get(&id)
            .map(|fields| StreamEntry::new(format_id(id), fields.clone()))
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, u64>,
    order: BTreeSet<(u64, String)>,
}

impl SortedSet {
    fn insert(&mut self, score: u64, member: &str) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.order.remove(&(old, member.to_string()));
        }
        self.order.insert((score, member.to_string()));
    }

    fn pop_due(&mut self, now: u64) -> Option<String> {
        let first = self.order.iter().next().cloned()?;
        if first.0 > now {
            return None;
        }
        self.order.remove(&first);
        self.scores.remove(&first.1);
        Some(first.1)
    }
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, StreamState>,
    queues: HashMap<String, SortedSet>,
}

impl State {
    fn group_mut(&mut self, key: &str, group: &str) -> Option<&mut GroupState> {
        self.streams.get_mut(key)?.groups.get_mut(group)
    }

    fn ensure_group(&mut self, key: &str, group: &str) {
        self.streams
            .entry(key.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
    }
}

/// Stream store held entirely in memory.
///
/// Share one instance (behind an `Arc`) between couriers to simulate several
/// processes in one consumer group.
#[derive(Debug)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    appended: Notify,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
            appended: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append_sync(&self, key: &str, id: &EntryId, fields: Vec<(String, String)>) -> Result<String> {
        let mut state = self.lock();
        let stream = state.streams.entry(key.to_string()).or_default();
        let last = stream.last_id;

        let next = match id {
            EntryId::Auto => {
                let now = self.clock.now_millis();
                if now > last.0 {
                    (now, 0)
                } else {
                    (last.0, last.1 + 1)
                }
            }
            EntryId::Explicit(raw) => {
                let parsed = super::parse_stream_id(raw).ok_or_else(|| {
                    CourierError::redis_msg("XADD", "ERR Invalid stream ID specified as stream command argument")
                })?;
                if parsed <= last || parsed == (0, 0) {
                    return Err(CourierError::redis_msg(
                        "XADD",
                        "ERR The ID specified in XADD is equal or smaller than the target stream top item",
                    ));
                }
                parsed
            }
        };

        stream.entries.insert(next, fields);
        stream.last_id = next;
        Ok(format_id(next))
    }

    fn read_new_sync(&self, key: &str, group: &str, consumer: &str, count: usize) -> Vec<StreamEntry> {
        let now = self.clock.now_millis();
        let mut state = self.lock();

        let Some(stream) = state.streams.get_mut(key) else {
            state.ensure_group(key, group);
            return Vec::new();
        };
        let StreamState {
            entries, groups, ..
        } = stream;
        let Some(group_state) = groups.get_mut(group) else {
            groups.insert(group.to_string(), GroupState::default());
            return Vec::new();
        };

        group_state.consumers.insert(consumer.to_string());

        let start = (group_state.last_delivered.0, group_state.last_delivered.1.saturating_add(1));
        let batch: Vec<StreamEntry> = entries
            .range(start..)
            .take(count)
            .map(|(id, fields)| StreamEntry::new(format_id(*id), fields.clone()))
            .collect();

        for entry in &batch {
            if let Some(id) = super::parse_stream_id(&entry.id) {
                group_state.last_delivered = id;
                group_state.pending.insert(
                    id,
                    PendingEntry {
                        consumer: consumer.to_string(),
                        delivered_at: now,
                        deliveries: 1,
                    },
                );
            }
        }
        batch
    }

    fn claim_sync(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Vec<StreamEntry> {
        let now = self.clock.now_millis();
        let min_idle = min_idle.as_millis() as u64;
        let mut state = self.lock();

        let Some(stream) = state.streams.get_mut(key) else {
            state.ensure_group(key, group);
            return Vec::new();
        };
        if !stream.groups.contains_key(group) {
            stream.groups.insert(group.to_string(), GroupState::default());
            return Vec::new();
        }

        let eligible: Vec<Id> = match stream.groups.get(group) {
            Some(g) => g
                .pending
                .iter()
                .filter(|(_, p)| now.saturating_sub(p.delivered_at) >= min_idle)
                .map(|(id, _)| *id)
                .take(count)
                .collect(),
            None => Vec::new(),
        };

        let mut claimed = Vec::with_capacity(eligible.len());
        let mut gone = Vec::new();
        for id in eligible {
            match stream.entry(id) {
                Some(entry) => claimed.push((id, entry)),
                // Deleted entries drop out of the pending list.
                None => gone.push(id),
            }
        }

        if let Some(group_state) = stream.groups.get_mut(group) {
            group_state.consumers.insert(consumer.to_string());
            for id in gone {
                group_state.pending.remove(&id);
            }
            for (id, _) in &claimed {
                if let Some(pending) = group_state.pending.get_mut(id) {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.deliveries += 1;
                }
            }
        }

        claimed.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Number of entries in a stream (0 if absent).
    pub fn stream_len(&self, key: &str) -> usize {
        self.lock().streams.get(key).map_or(0, |s| s.entries.len())
    }

    /// All entries of a stream in id order.
    pub fn entries(&self, key: &str) -> Vec<StreamEntry> {
        self.lock()
            .streams
            .get(key)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, fields)| StreamEntry::new(format_id(*id), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pending (delivered, unacknowledged) entries for a group.
    pub fn pending_count(&self, key: &str, group: &str) -> usize {
        let mut state = self.lock();
        state.group_mut(key, group).map_or(0, |g| g.pending.len())
    }

    /// How many times an entry has been delivered to the group.
    pub fn delivery_count(&self, key: &str, group: &str, id: &str) -> Option<u64> {
        let id = super::parse_stream_id(id)?;
        let mut state = self.lock();
        state
            .group_mut(key, group)
            .and_then(|g| g.pending.get(&id).map(|p| p.deliveries))
    }

    /// Registered consumers of a group, sorted.
    pub fn consumers(&self, key: &str, group: &str) -> Vec<String> {
        let mut state = self.lock();
        let mut consumers: Vec<String> = state
            .group_mut(key, group)
            .map(|g| g.consumers.iter().cloned().collect())
            .unwrap_or_default();
        consumers.sort();
        consumers
    }

    /// Delay-queue contents as (due, payload) in due order.
    pub fn scheduled(&self, queue_key: &str) -> Vec<(u64, String)> {
        self.lock()
            .queues
            .get(queue_key)
            .map(|q| q.order.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl StreamStore for MemoryStore {
    fn append<'a>(
        &'a self,
        key: &'a str,
        id: EntryId,
        fields: Vec<(String, String)>,
    ) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let id = self.append_sync(key, &id, fields)?;
            self.appended.notify_waiters();
            trace!(key = %key, id = %id, "Appended entry");
            Ok(id)
        })
    }

    fn create_group_if_absent<'a>(&'a self, key: &'a str, group: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.lock().ensure_group(key, group);
            Ok(())
        })
    }

    fn read_new<'a>(
        &'a self,
        key: &'a str,
        group: &'a str,
        consumer: &'a str,
        count: usize,
        block: Option<Duration>,
    ) -> BoxFuture<'a, Vec<StreamEntry>> {
        Box::pin(async move {
            let deadline = block
                .filter(|d| !d.is_zero())
                .map(|d| tokio::time::Instant::now() + d);

            loop {
                // Register interest before checking so an append between the
                // check and the wait is not missed.
                let notified = self.appended.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let batch = self.read_new_sync(key, group, consumer, count);
                if !batch.is_empty() {
                    return Ok(batch);
                }

                let Some(deadline) = deadline else {
                    return Ok(batch);
                };
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(Vec::new());
                }
            }
        })
    }

    fn claim_stale<'a>(
        &'a self,
        key: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        count: usize,
    ) -> BoxFuture<'a, Vec<StreamEntry>> {
        Box::pin(async move { Ok(self.claim_sync(key, group, consumer, min_idle, count)) })
    }

    fn ack<'a>(&'a self, key: &'a str, group: &'a str, ids: &'a [String]) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let mut state = self.lock();
            let Some(group_state) = state.group_mut(key, group) else {
                return Ok(0);
            };
            let acked = ids
                .iter()
                .filter_map(|id| super::parse_stream_id(id))
                .filter(|id| group_state.pending.remove(id).is_some())
                .count();
            Ok(acked)
        })
    }

    fn read_pending<'a>(
        &'a self,
        key: &'a str,
        group: &'a str,
        consumer: &'a str,
        count: usize,
    ) -> BoxFuture<'a, Vec<StreamEntry>> {
        Box::pin(async move {
            let state = self.lock();
            let Some(stream) = state.streams.get(key) else {
                return Ok(Vec::new());
            };
            let Some(group_state) = stream.groups.get(group) else {
                return Ok(Vec::new());
            };
            Ok(group_state
                .pending
                .iter()
                .filter(|(_, p)| p.consumer == consumer)
                .take(count)
                .map(|(id, _)| {
                    stream
                        .entry(*id)
                        .unwrap_or_else(|| StreamEntry::new(format_id(*id), Vec::new()))
                })
                .collect())
        })
    }

    fn deregister_consumer<'a>(
        &'a self,
        key: &'a str,
        group: &'a str,
        consumer: &'a str,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.lock();
            let Some(group_state) = state.group_mut(key, group) else {
                return Ok(false);
            };
            group_state.consumers.remove(consumer);
            group_state.pending.retain(|_, p| p.consumer != consumer);
            Ok(true)
        })
    }

    fn schedule_add<'a>(
        &'a self,
        queue_key: &'a str,
        due_millis: u64,
        payload: &'a str,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.lock()
                .queues
                .entry(queue_key.to_string())
                .or_default()
                .insert(due_millis, payload);
            Ok(())
        })
    }

    fn schedule_pop_due<'a>(
        &'a self,
        queue_key: &'a str,
        now_millis: u64,
    ) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut state = self.lock();
            let Some(queue) = state.queues.get_mut(queue_key) else {
                return Ok(None);
            };
            let popped = queue.pop_due(now_millis);
            if queue.order.is_empty() {
                state.queues.remove(queue_key);
            }
            Ok(popped)
        })
    }

    fn list_keys<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let state = self.lock();
            let mut keys: Vec<String> = state
                .streams
                .keys()
                .chain(state.queues.keys())
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(1_000);
        (MemoryStore::new(Arc::new(clock.clone())), clock)
    }

    fn fields(data: &str) -> Vec<(String, String)> {
        vec![("data".to_string(), data.to_string())]
    }

    #[tokio::test]
    async fn test_append_ids_increase_within_same_millisecond() {
        let (store, clock) = store();
        let a = store.append("s", EntryId::Auto, fields("a")).await.unwrap();
        let b = store.append("s", EntryId::Auto, fields("b")).await.unwrap();
        clock.advance(Duration::from_millis(5));
        let c = store.append("s", EntryId::Auto, fields("c")).await.unwrap();

        assert_eq!(a, "1000-0");
        assert_eq!(b, "1000-1");
        assert_eq!(c, "1005-0");
    }

    #[tokio::test]
    async fn test_explicit_id_must_increase() {
        let (store, _) = store();
        store
            .append("s", EntryId::Explicit("5-0".into()), fields("a"))
            .await
            .unwrap();
        let err = store
            .append("s", EntryId::Explicit("5-0".into()), fields("b"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("equal or smaller"));
        assert!(store
            .append("s", EntryId::Explicit("0-0".into()), fields("c"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_group_reads_each_entry_once() {
        let (store, _) = store();
        store.create_group_if_absent("s", "g").await.unwrap();
        for d in ["1", "2", "3"] {
            store.append("s", EntryId::Auto, fields(d)).await.unwrap();
        }

        let first = store.read_new("s", "g", "c1", 2, None).await.unwrap();
        let second = store.read_new("s", "g", "c2", 10, None).await.unwrap();
        let third = store.read_new("s", "g", "c1", 10, None).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first[0].field("data"), Some("1"));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].field("data"), Some("3"));
        assert!(third.is_empty());
        assert_eq!(store.pending_count("s", "g"), 3);
    }

    #[tokio::test]
    async fn test_group_created_before_entries_sees_them() {
        let (store, _) = store();
        store.append("s", EntryId::Auto, fields("early")).await.unwrap();
        store.create_group_if_absent("s", "g").await.unwrap();
        // Idempotent.
        store.create_group_if_absent("s", "g").await.unwrap();

        let batch = store.read_new("s", "g", "c", 10, None).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_read_without_group_self_heals() {
        let (store, _) = store();
        let batch = store.read_new("missing", "g", "c", 10, None).await.unwrap();
        assert!(batch.is_empty());

        store.append("missing", EntryId::Auto, fields("x")).await.unwrap();
        let batch = store.read_new("missing", "g", "c", 10, None).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let store = Arc::new(MemoryStore::default());
        store.create_group_if_absent("s", "g").await.unwrap();

        let reader = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .read_new("s", "g", "c", 10, Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append("s", EntryId::Auto, fields("late")).await.unwrap();

        let batch = reader.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let store = MemoryStore::default();
        let batch = store
            .read_new("s", "g", "c", 10, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_min_idle() {
        let (store, clock) = store();
        store.create_group_if_absent("s", "g").await.unwrap();
        store.append("s", EntryId::Auto, fields("a")).await.unwrap();
        let delivered = store.read_new("s", "g", "crashed", 10, None).await.unwrap();
        let id = delivered[0].id.clone();

        let early = store
            .claim_stale("s", "g", "rescuer", Duration::from_secs(5), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        clock.advance(Duration::from_secs(5));
        let claimed = store
            .claim_stale("s", "g", "rescuer", Duration::from_secs(5), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(store.delivery_count("s", "g", &id), Some(2));

        // Claiming resets idle time.
        let again = store
            .claim_stale("s", "g", "other", Duration::from_secs(5), 10)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_ack_removes_from_pending() {
        let (store, clock) = store();
        store.create_group_if_absent("s", "g").await.unwrap();
        store.append("s", EntryId::Auto, fields("a")).await.unwrap();
        let delivered = store.read_new("s", "g", "c", 10, None).await.unwrap();
        let ids = vec![delivered[0].id.clone()];

        assert_eq!(store.ack("s", "g", &ids).await.unwrap(), 1);
        assert_eq!(store.ack("s", "g", &ids).await.unwrap(), 0);
        assert_eq!(store.pending_count("s", "g"), 0);

        clock.advance(Duration::from_secs(60));
        let claimed = store
            .claim_stale("s", "g", "c2", Duration::from_secs(1), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_deregister_consumer() {
        let (store, _) = store();
        store.create_group_if_absent("s", "g").await.unwrap();
        store.append("s", EntryId::Auto, fields("a")).await.unwrap();
        store.read_new("s", "g", "c1", 10, None).await.unwrap();
        store.read_new("s", "g", "c2", 10, None).await.unwrap();
        assert_eq!(store.consumers("s", "g"), vec!["c1", "c2"]);

        assert!(store.deregister_consumer("s", "g", "c1").await.unwrap());
        assert_eq!(store.consumers("s", "g"), vec!["c2"]);
        assert_eq!(store.pending_count("s", "g"), 0);

        assert!(!store.deregister_consumer("s", "nope", "c1").await.unwrap());
        assert!(!store.deregister_consumer("absent", "g", "c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_pending_is_per_consumer() {
        let (store, _) = store();
        store.create_group_if_absent("s", "g").await.unwrap();
        for d in ["a", "b", "c"] {
            store.append("s", EntryId::Auto, fields(d)).await.unwrap();
        }
        store.read_new("s", "g", "c1", 2, None).await.unwrap();
        store.read_new("s", "g", "c2", 10, None).await.unwrap();

        let mine = store.read_pending("s", "g", "c1", 10).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].field("data"), Some("a"));
        assert_eq!(mine[1].field("data"), Some("b"));
        assert_eq!(store.read_pending("s", "g", "c1", 1).await.unwrap().len(), 1);

        // Reading pending does not change ownership or delivery counts.
        assert_eq!(store.delivery_count("s", "g", &mine[0].id), Some(1));
        assert!(store.read_pending("s", "g", "c3", 10).await.unwrap().is_empty());
        assert!(store.read_pending("s", "nope", "c1", 10).await.unwrap().is_empty());
        assert!(store.read_pending("absent", "g", "c1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delay_queue_pops_only_due_in_order() {
        let (store, _) = store();
        store.schedule_add("q", 300, "late").await.unwrap();
        store.schedule_add("q", 100, "early").await.unwrap();
        store.schedule_add("q", 200, "middle").await.unwrap();

        assert_eq!(store.schedule_pop_due("q", 50).await.unwrap(), None);
        assert_eq!(
            store.schedule_pop_due("q", 250).await.unwrap().as_deref(),
            Some("early")
        );
        assert_eq!(
            store.schedule_pop_due("q", 250).await.unwrap().as_deref(),
            Some("middle")
        );
        assert_eq!(store.schedule_pop_due("q", 250).await.unwrap(), None);
        assert_eq!(store.scheduled("q"), vec![(300, "late".to_string())]);
    }

    #[tokio::test]
    async fn test_empty_queue_key_disappears() {
        let (store, _) = store();
        store.schedule_add("ns:q", 1, "x").await.unwrap();
        assert_eq!(store.list_keys("ns:").await.unwrap(), vec!["ns:q"]);

        store.schedule_pop_due("ns:q", 10).await.unwrap();
        assert!(store.list_keys("ns:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_keys_by_prefix() {
        let (store, _) = store();
        store.append("ns:a", EntryId::Auto, fields("1")).await.unwrap();
        store.create_group_if_absent("ns:b", "g").await.unwrap();
        store.schedule_add("ns:a-scheduled", 5, "x").await.unwrap();
        store.append("other:c", EntryId::Auto, fields("1")).await.unwrap();

        let keys = store.list_keys("ns:").await.unwrap();
        assert_eq!(keys, vec!["ns:a", "ns:a-scheduled", "ns:b"]);
    }
}
