// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stream store capability.
//!
//! Everything the courier persists goes through [`StreamStore`]: stream
//! append/read/claim/ack with consumer groups, a score-ordered delay queue,
//! consumer hand-back and deregistration, and key enumeration.
//!
//! Two implementations are provided:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`RedisStore`] | Production. One pooled connection per call. |
//! | [`MemoryStore`] | In-process, same consumer-group semantics. Tests and embedded use. |
//!
//! The backend is picked from [`Backend`](crate::config::Backend) when the
//! courier connects.
//!
//! # Persisted Layout
//!
//! ```text
//! {namespace}{topic}             live stream (consumer group = durable name)
//! {namespace}{topic}-scheduled   delay queue, score = due epoch ms
//! {namespace}{topic}-failed      failed-attempt audit stream
//! {namespace}{topic}-dlq         dead-letter stream
//! {namespace}{topic}-res         response stream for services
//! ```

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::error::Result;
use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by [`StreamStore`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One stream entry: its id and field/value pairs in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Value of the first field called `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Id to use when appending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryId {
    /// Let the store assign the next id (`*`).
    Auto,
    /// Use this id. Must be greater than the stream's last id.
    Explicit(String),
}

impl EntryId {
    pub(crate) fn as_arg(&self) -> &str {
        match self {
            EntryId::Auto => "*",
            EntryId::Explicit(id) => id,
        }
    }
}

/// Store operations the courier needs.
///
/// Implementations must be safe to share between tasks; each call is
/// independent and relies on the store's own atomicity.
pub trait StreamStore: Send + Sync + 'static {
    /// Append an entry and return its id.
    fn append<'a>(
        &'a self,
        key: &'a str,
        id: EntryId,
        fields: Vec<(String, String)>,
    ) -> BoxFuture<'a, String>;

    /// Create `group` on `key` starting from the beginning of the stream,
    /// creating the stream if needed. An existing group is not an error.
    fn create_group_if_absent<'a>(&'a self, key: &'a str, group: &'a str) -> BoxFuture<'a, ()>;

    /// Read entries never delivered to the group.
    ///
    /// A missing group is created and the call returns no entries.
    fn read_new<'a>(
        &'a self,
        key: &'a str,
        group: &'a str,
        consumer: &'a str,
        count: usize,
        block: Option<Duration>,
    ) -> BoxFuture<'a, Vec<StreamEntry>>;

    /// Take over entries that have been pending longer than `min_idle`.
    ///
    /// A missing group is created and the call returns no entries.
    fn claim_stale<'a>(
        &'a self,
        key: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        count: usize,
    ) -> BoxFuture<'a, Vec<StreamEntry>>;

    /// Acknowledge entries; returns how many were pending.
    fn ack<'a>(&'a self, key: &'a str, group: &'a str, ids: &'a [String]) -> BoxFuture<'a, usize>;

    /// Entries pending for `consumer` in `group`, oldest first, at most
    /// `count`. Entries since deleted from the stream come back with no
    /// fields. A key that is not a stream, or lacks the group, has none.
    fn read_pending<'a>(
        &'a self,
        key: &'a str,
        group: &'a str,
        consumer: &'a str,
        count: usize,
    ) -> BoxFuture<'a, Vec<StreamEntry>>;

    /// Remove `consumer` from `group` on `key`. Returns `false` when the key
    /// is not a stream or has no such group.
    fn deregister_consumer<'a>(
        &'a self,
        key: &'a str,
        group: &'a str,
        consumer: &'a str,
    ) -> BoxFuture<'a, bool>;

    /// Add `payload` to a delay queue, due at `due_millis`.
    fn schedule_add<'a>(
        &'a self,
        queue_key: &'a str,
        due_millis: u64,
        payload: &'a str,
    ) -> BoxFuture<'a, ()>;

    /// Atomically remove and return the earliest entry due at or before
    /// `now_millis`.
    fn schedule_pop_due<'a>(
        &'a self,
        queue_key: &'a str,
        now_millis: u64,
    ) -> BoxFuture<'a, Option<String>>;

    /// All keys starting with `prefix`.
    fn list_keys<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Vec<String>>;

    /// Release resources. Later calls may fail.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Every key derived from one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicKeys {
    pub stream: String,
    pub scheduled: String,
    pub failed: String,
    pub dead_letter: String,
    pub response: String,
}

impl TopicKeys {
    pub fn new(namespace: &str, topic: &str) -> Self {
        let stream = format!("{}{}", namespace, topic);
        Self {
            scheduled: format!("{}-scheduled", stream),
            failed: format!("{}-failed", stream),
            dead_letter: format!("{}-dlq", stream),
            response: format!("{}-res", stream),
            stream,
        }
    }

    /// Keys for the response side of a service topic.
    pub fn responses(namespace: &str, topic: &str) -> Self {
        Self::new(namespace, &format!("{}-res", topic))
    }
}

/// Parse a stream id of the form `{ms}-{seq}`. A bare number means seq 0.
pub fn parse_stream_id(id: &str) -> Option<(u64, u64)> {
    match id.split_once('-') {
        Some((ms, seq)) => Some((ms.parse().ok()?, seq.parse().ok()?)),
        None => Some((id.parse().ok()?, 0)),
    }
}

/// Compare two stream ids numerically.
///
/// Ids are `{timestamp}-{sequence}` (e.g. "1234567890123-0"). Malformed
/// parts compare as zero.
pub fn compare_stream_ids(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> (u64, u64) {
        match s.split_once('-') {
            Some((ts, seq)) => (ts.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
            None => (s.parse().unwrap_or(0), 0),
        }
    };

    parse(a).cmp(&parse(b))
}
