// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry and escalation for failed deliveries.
//!
//! # Disposition
//!
//! ```text
//!                    ┌─ exhausted && !force ─► dead-letter record
//! failed delivery ───┼─ Immediate ───────────► re-append now, retryCount+1
//!                    ├─ ExponentialBackoff ──► delay queue at now + base·2^(n+1), retryCount+1
//!                    └─ At(ts) ──────────────► delay queue at ts (retryCount+1 only if forced)
//! ```
//!
//! Exactly one disposition is applied, then the pending entry is
//! acknowledged so the claim path cannot hand it out again. Every failure is
//! also appended to the `-failed` audit stream from a detached task; a
//! failing audit write is logged and otherwise ignored.

use crate::clock::Clock;
use crate::error::Result;
use crate::message::{self, DeadLetter, FailedAttempt, FailureInfo, Message, ScheduledEntry};
use crate::metrics;
use crate::store::{EntryId, StreamStore, TopicKeys};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// How to redeliver a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    /// Re-append to the live stream right away.
    Immediate,
    /// Redeliver at an epoch-millisecond timestamp.
    At(u64),
    /// Redeliver after `base * 2^(retryCount + 1)`.
    #[default]
    ExponentialBackoff,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::At(_) => "at",
            Self::ExponentialBackoff => "exponential_backoff",
        }
    }
}

/// Strategy plus the `force` override.
///
/// `force` skips the dead-letter check so the message is retried even when
/// it is out of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryOptions {
    pub strategy: RetryStrategy,
    pub force: bool,
}

impl RetryOptions {
    pub fn immediate() -> Self {
        Self {
            strategy: RetryStrategy::Immediate,
            force: false,
        }
    }

    pub fn at(timestamp_millis: u64) -> Self {
        Self {
            strategy: RetryStrategy::At(timestamp_millis),
            force: false,
        }
    }

    pub fn exponential_backoff() -> Self {
        Self::default()
    }

    /// Retry even if the message is out of retries.
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// What happened to a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Re-appended to the live stream under a new id.
    Requeued { id: String },
    /// Put on the delay queue.
    Scheduled { due_at: u64 },
    /// Written to the dead-letter stream.
    DeadLettered,
}

/// Delay before retry number `retry_count + 1`.
pub fn backoff_delay(base: Duration, retry_count: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry_count.saturating_add(1));
    base.checked_mul(factor).unwrap_or(Duration::MAX)
}

/// A message pulled from a topic, identified for settlement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub keys: TopicKeys,
    pub group: String,
    /// Entry id on the live stream.
    pub id: String,
    pub message: Message,
}

impl Delivery {
    /// Acknowledge the pending entry.
    pub async fn ack(&self, store: &dyn StreamStore) -> Result<()> {
        store
            .ack(&self.keys.stream, &self.group, std::slice::from_ref(&self.id))
            .await?;
        metrics::record_acked(&self.topic);
        Ok(())
    }
}

/// Applies retry dispositions.
#[derive(Clone)]
pub struct RetryEngine {
    store: Arc<dyn StreamStore>,
    clock: Arc<dyn Clock>,
    backoff_base: Duration,
}

impl RetryEngine {
    pub fn new(store: Arc<dyn StreamStore>, clock: Arc<dyn Clock>, backoff_base: Duration) -> Self {
        Self {
            store,
            clock,
            backoff_base,
        }
    }

    /// Record a failure, dispose of the message and acknowledge the entry.
    pub async fn fail(
        &self,
        delivery: &Delivery,
        options: RetryOptions,
        failure: FailureInfo,
    ) -> Result<Disposition> {
        let now = self.clock.now_millis();
        self.spawn_audit(delivery, failure, now);

        let disposition = self.dispose(delivery, options, now).await?;
        delivery.ack(self.store.as_ref()).await?;
        Ok(disposition)
    }

    /// Audit a delivery that will not be retried and acknowledge it.
    pub async fn reject(&self, delivery: &Delivery, failure: FailureInfo) -> Result<()> {
        self.spawn_audit(delivery, failure, self.clock.now_millis());
        delivery.ack(self.store.as_ref()).await
    }

    async fn dispose(
        &self,
        delivery: &Delivery,
        options: RetryOptions,
        now: u64,
    ) -> Result<Disposition> {
        let message = &delivery.message;

        if message.is_exhausted() && !options.force {
            let letter = DeadLetter {
                message: message.clone(),
                timestamp: now,
            };
            self.store
                .append(
                    &delivery.keys.dead_letter,
                    EntryId::Auto,
                    message::record_fields(&letter)?,
                )
                .await?;
            metrics::record_dead_lettered(&delivery.topic);
            error!(
                topic = %delivery.topic,
                msg_id = %delivery.id,
                retry_count = message.retry_count,
                max_retries = message.max_retries,
                "Message exhausted its retries, moved to dead-letter queue"
            );
            return Ok(Disposition::DeadLettered);
        }

        metrics::record_retry(&delivery.topic, options.strategy.as_str());

        match options.strategy {
            RetryStrategy::Immediate => {
                let id = self
                    .store
                    .append(&delivery.keys.stream, EntryId::Auto, message.retried().to_fields())
                    .await?;
                debug!(topic = %delivery.topic, msg_id = %delivery.id, new_id = %id, "Requeued message");
                Ok(Disposition::Requeued { id })
            }
            RetryStrategy::ExponentialBackoff => {
                let delay = backoff_delay(self.backoff_base, message.retry_count);
                let due_at = now.saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
                self.schedule(delivery, message.retried(), due_at).await
            }
            RetryStrategy::At(due_at) => {
                let message = if options.force {
                    message.retried()
                } else {
                    message.clone()
                };
                self.schedule(delivery, message, due_at).await
            }
        }
    }

    async fn schedule(&self, delivery: &Delivery, message: Message, due_at: u64) -> Result<Disposition> {
        let entry = ScheduledEntry {
            topic: delivery.topic.clone(),
            id: delivery.id.clone(),
            message,
            due_timestamp: due_at,
        };
        self.store
            .schedule_add(&delivery.keys.scheduled, due_at, &entry.encode()?)
            .await?;
        debug!(
            topic = %delivery.topic,
            msg_id = %delivery.id,
            due_at,
            retry_count = entry.message.retry_count,
            "Scheduled message for redelivery"
        );
        Ok(Disposition::Scheduled { due_at })
    }

    fn spawn_audit(&self, delivery: &Delivery, failure: FailureInfo, now: u64) {
        let attempt = FailedAttempt {
            message: delivery.message.clone(),
            error: failure,
            timestamp: now,
        };
        let fields = match message::record_fields(&attempt) {
            Ok(fields) => fields,
            Err(e) => {
                warn!(topic = %delivery.topic, error = %e, "Could not encode failed-attempt record");
                return;
            }
        };

        let store = Arc::clone(&self.store);
        let key = delivery.keys.failed.clone();
        let topic = delivery.topic.clone();
        tokio::spawn(async move {
            if let Err(e) = store.append(&key, EntryId::Auto, fields).await {
                warn!(topic = %topic, error = %e, "Failed to write failed-attempt record");
            }
        });
    }
}
