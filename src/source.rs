// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull-based message source for one topic.
//!
//! # Poll Cycle
//!
//! ```text
//! next() ──► buffer non-empty? ──yes──► pop front
//!               │ no
//!               ▼
//!          alive? ──no──► None (source is finished for good)
//!               │ yes
//!               ▼
//!          read_new  ◄─── alternates ───►  claim_stale
//!               │
//!               ▼
//!          promote due delay-queue entries onto the live stream
//!               │
//!               ▼
//!          buffer the batch, loop
//! ```
//!
//! Alternating read and claim keeps fresh messages flowing while still
//! picking up entries abandoned by a crashed consumer; neither path can
//! starve the other. Promoted entries keep their retry metadata and are
//! seen by a later read.
//!
//! Liveness is checked only between polls. A store call in flight is
//! allowed to finish.

use crate::clock::Clock;
use crate::config::SourceConfig;
use crate::error::Result;
use crate::message::ScheduledEntry;
use crate::metrics;
use crate::store::{EntryId, StreamEntry, StreamStore, TopicKeys};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{trace, warn};

/// Tuning for one source.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub read_count: usize,
    pub block: Option<Duration>,
    pub claim_min_idle: Duration,
    pub claim_count: usize,
    pub scheduled_per_poll: usize,
}

impl SourceOptions {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            read_count: config.read_count.max(1),
            block: config.block_duration(),
            claim_min_idle: config.claim_min_idle_duration(),
            claim_count: config.claim_count.max(1),
            scheduled_per_poll: config.scheduled_per_poll,
        }
    }

    /// Fetch one entry at a time.
    pub fn one_at_a_time(mut self) -> Self {
        self.read_count = 1;
        self.claim_count = 1;
        self
    }
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self::from_config(&SourceConfig::default())
    }
}

/// Where a consumer reads from and who it is.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic: String,
    pub keys: TopicKeys,
    pub group: String,
    pub consumer: String,
}

/// Lazily polled, possibly endless sequence of raw entries for one topic.
///
/// Not restartable: once [`next()`](Self::next) returns `None`, create a new
/// source.
pub struct MessageSource {
    store: Arc<dyn StreamStore>,
    clock: Arc<dyn Clock>,
    subscription: Subscription,
    options: SourceOptions,
    alive: watch::Receiver<bool>,
    fetch_new: bool,
    buffer: VecDeque<StreamEntry>,
    finished: bool,
}

impl MessageSource {
    pub fn new(
        store: Arc<dyn StreamStore>,
        clock: Arc<dyn Clock>,
        subscription: Subscription,
        options: SourceOptions,
        alive: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            clock,
            subscription,
            options,
            alive,
            fetch_new: true,
            buffer: VecDeque::new(),
            finished: false,
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Whether the source has stopped producing.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next entry, or `None` once the engine is no longer alive.
    ///
    /// Buffered entries are still handed out after liveness drops; callers
    /// that care should check liveness themselves.
    pub async fn next(&mut self) -> Result<Option<StreamEntry>> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Ok(Some(entry));
            }
            if self.finished || !*self.alive.borrow() {
                self.finished = true;
                return Ok(None);
            }

            let found = self.poll_once().await?;
            if found == 0 && self.options.block.is_none() {
                tokio::task::yield_now().await;
            }
        }
    }

    /// One read-or-claim round plus delay-queue promotion. Returns how many
    /// entries were buffered.
    async fn poll_once(&mut self) -> Result<usize> {
        let sub = &self.subscription;
        let fetch_new = self.fetch_new;
        self.fetch_new = !self.fetch_new;

        let batch = if fetch_new {
            let batch = self
                .store
                .read_new(
                    &sub.keys.stream,
                    &sub.group,
                    &sub.consumer,
                    self.options.read_count,
                    self.options.block,
                )
                .await?;
            metrics::record_delivered(&sub.topic, batch.len());
            batch
        } else {
            let batch = self
                .store
                .claim_stale(
                    &sub.keys.stream,
                    &sub.group,
                    &sub.consumer,
                    self.options.claim_min_idle,
                    self.options.claim_count,
                )
                .await?;
            if !batch.is_empty() {
                warn!(
                    topic = %sub.topic,
                    count = batch.len(),
                    "Claimed stale messages from another consumer"
                );
            }
            metrics::record_claimed(&sub.topic, batch.len());
            metrics::record_delivered(&sub.topic, batch.len());
            batch
        };

        self.promote_due().await?;

        let found = batch.len();
        if found > 0 {
            trace!(
                topic = %self.subscription.topic,
                count = found,
                first_id = %batch.first().map(|e| e.id.as_str()).unwrap_or(""),
                fetch_new,
                "Polled entries"
            );
        }
        self.buffer.extend(batch);
        Ok(found)
    }

    /// Move due delay-queue entries back onto the live stream.
    async fn promote_due(&self) -> Result<()> {
        let sub = &self.subscription;
        let mut promoted = 0;

        while promoted < self.options.scheduled_per_poll {
            let now = self.clock.now_millis();
            let Some(raw) = self.store.schedule_pop_due(&sub.keys.scheduled, now).await? else {
                break;
            };

            match ScheduledEntry::decode(&raw) {
                Ok(scheduled) => {
                    let id = self
                        .store
                        .append(&sub.keys.stream, EntryId::Auto, scheduled.message.to_fields())
                        .await?;
                    trace!(
                        topic = %sub.topic,
                        original_id = %scheduled.id,
                        new_id = %id,
                        retry_count = scheduled.message.retry_count,
                        "Promoted scheduled message"
                    );
                    promoted += 1;
                }
                Err(e) => {
                    // Already removed from the queue; nothing to put back.
                    warn!(topic = %sub.topic, error = %e, "Dropping undecodable scheduled entry");
                }
            }
        }

        metrics::record_scheduled_promotions(&sub.topic, promoted);
        Ok(())
    }
}
