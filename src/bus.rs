// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Topic publish/subscribe.
//!
//! An [`Event<T>`] is a typed handle on one topic. `publish` validates and
//! writes; `subscribe` pulls from a [`MessageSource`], decodes, validates
//! and calls the handler with a [`MessageHandle`].
//!
//! # Handler Outcomes
//!
//! | Handler | Result |
//! |---------|--------|
//! | calls `ack()` | entry acknowledged |
//! | calls `retry(opts)` | retry engine applies `opts`, entry acknowledged |
//! | returns `Err` / panics, unsettled | exponential backoff (or dead-letter), entry acknowledged |
//! | returns `Ok`, unsettled | entry stays pending; redelivered through claim |
//!
//! An entry that cannot be decoded or fails the schema is audited as a
//! `DecodeError`, acknowledged and skipped. The loop keeps going.
//!
//! Several subscribers on one topic (in one process or many) share the
//! consumer group, so each message goes to one of them.

use crate::engine::{CourierInner, Session};
use crate::error::{BoxError, CourierError, Result, ValidationStage};
use crate::message::{FailureInfo, Message};
use crate::metrics;
use crate::retry::{Delivery, Disposition, RetryOptions};
use crate::schema::Schema;
use crate::source::{MessageSource, Subscription};
use crate::store::{EntryId, StreamEntry, TopicKeys};
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Validate `payload` against `schema` and return the JSON text to store.
pub(crate) fn encode_payload<T: Serialize + 'static>(
    schema: &dyn Schema<T>,
    payload: &T,
    topic: &str,
    stage: ValidationStage,
) -> Result<String> {
    let value = serde_json::to_value(payload)
        .map_err(|e| CourierError::validation(topic, stage, e.to_string()))?;
    let parsed = schema
        .parse(value)
        .map_err(|e| CourierError::validation(topic, stage, e.0))?;
    serde_json::to_string(&parsed).map_err(|e| CourierError::validation(topic, stage, e.to_string()))
}

/// Parse stored JSON text and validate it.
pub(crate) fn decode_payload<T: 'static>(
    schema: &dyn Schema<T>,
    data: &str,
    topic: &str,
    stage: ValidationStage,
) -> Result<T> {
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| CourierError::validation(topic, stage, format!("invalid JSON: {}", e)))?;
    schema
        .parse(value)
        .map_err(|e| CourierError::validation(topic, stage, e.0))
}

/// Per-publish overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Overrides the event's default max retries.
    pub max_retries: Option<u32>,
}

struct HandleInner {
    delivery: Delivery,
    session: Arc<Session>,
    settled: AtomicBool,
}

/// Settlement handle passed to subscription handlers.
///
/// Clones share state: settling through any clone settles them all.
#[derive(Clone)]
pub struct MessageHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for MessageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandle")
            .field("topic", &self.inner.delivery.topic)
            .field("id", &self.inner.delivery.id)
            .field("retry_count", &self.retry_count())
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl MessageHandle {
    pub(crate) fn new(delivery: Delivery, session: Arc<Session>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                delivery,
                session,
                settled: AtomicBool::new(false),
            }),
        }
    }

    /// Stream entry id.
    pub fn id(&self) -> &str {
        &self.inner.delivery.id
    }

    pub fn topic(&self) -> &str {
        &self.inner.delivery.topic
    }

    /// Failed deliveries recorded so far.
    pub fn retry_count(&self) -> u32 {
        self.inner.delivery.message.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.inner.delivery.message.max_retries
    }

    /// Whether `ack` or `retry` has been called.
    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::SeqCst)
    }

    /// Claim the single settlement. Returns false if already settled.
    fn try_settle(&self) -> bool {
        !self.inner.settled.swap(true, Ordering::SeqCst)
    }

    fn already_settled(&self) -> CourierError {
        CourierError::AlreadySettled {
            msg_id: self.id().to_string(),
        }
    }

    /// Acknowledge successful processing.
    pub async fn ack(&self) -> Result<()> {
        if !self.try_settle() {
            return Err(self.already_settled());
        }
        self.inner
            .delivery
            .ack(self.inner.session.store.as_ref())
            .await
    }

    /// Give the message back for redelivery according to `options`.
    pub async fn retry(&self, options: RetryOptions) -> Result<Disposition> {
        if !self.try_settle() {
            return Err(self.already_settled());
        }
        self.inner
            .session
            .retry
            .fail(
                &self.inner.delivery,
                options,
                FailureInfo::new("RetryRequested", "retry requested by handler"),
            )
            .await
    }
}

/// Decrements the subscription gauge when a loop ends, however it ends.
struct ActiveGuard<'a> {
    topic: &'a str,
    active: &'a AtomicUsize,
}

impl<'a> ActiveGuard<'a> {
    fn enter(topic: &'a str, active: &'a AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_subscriptions(topic, now);
        Self { topic, active }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let now = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_active_subscriptions(self.topic, now);
    }
}

/// Typed publish/subscribe handle for one topic.
pub struct Event<T> {
    topic: String,
    keys: TopicKeys,
    schema: Arc<dyn Schema<T>>,
    max_retries: u32,
    courier: Arc<CourierInner>,
    active: Arc<AtomicUsize>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            keys: self.keys.clone(),
            schema: Arc::clone(&self.schema),
            max_retries: self.max_retries,
            courier: Arc::clone(&self.courier),
            active: Arc::clone(&self.active),
        }
    }
}

impl<T: Send + 'static> Event<T> {
    pub(crate) fn new(
        courier: Arc<CourierInner>,
        topic: &str,
        schema: Arc<dyn Schema<T>>,
        max_retries: u32,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            keys: TopicKeys::new(&courier.config.namespace, topic),
            schema,
            max_retries,
            courier,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Default max retries for messages published through this handle.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn keys(&self) -> &TopicKeys {
        &self.keys
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Validate and publish. Returns the new entry id.
    pub async fn publish(&self, payload: &T) -> Result<String>
    where
        T: Serialize,
    {
        self.publish_with(payload, PublishOptions::default()).await
    }

    /// Publish with per-message overrides.
    pub async fn publish_with(&self, payload: &T, options: PublishOptions) -> Result<String>
    where
        T: Serialize,
    {
        let data = encode_payload(self.schema.as_ref(), payload, &self.topic, ValidationStage::Publish)?;
        let session = self.courier.session()?;
        let message = Message::new(data, options.max_retries.unwrap_or(self.max_retries));

        let id = session
            .store
            .append(&self.keys.stream, EntryId::Auto, message.to_fields())
            .await?;
        metrics::record_published(&self.topic);
        debug!(topic = %self.topic, msg_id = %id, "Published message");
        Ok(id)
    }

    /// Consume the topic until the courier disconnects.
    ///
    /// Returns `Ok(())` on disconnect. Store failures end the loop with an
    /// error; handler failures never do.
    pub async fn subscribe<H, Fut>(&self, handler: H) -> Result<()>
    where
        H: Fn(T, MessageHandle) -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send,
    {
        let session = self.courier.session()?;
        let span = info_span!("subscribe", topic = %self.topic);

        async {
            let _active = ActiveGuard::enter(&self.topic, &self.active);
            session
                .store
                .create_group_if_absent(&self.keys.stream, &session.group)
                .await?;

            let mut source = MessageSource::new(
                Arc::clone(&session.store),
                Arc::clone(&session.clock),
                Subscription {
                    topic: self.topic.clone(),
                    keys: self.keys.clone(),
                    group: session.group.clone(),
                    consumer: session.consumer.clone(),
                },
                session.source_options.clone(),
                self.courier.alive_receiver(),
            );

            info!("Subscription started");
            while let Some(entry) = source.next().await? {
                self.handle_entry(&session, entry, &handler).await?;
            }
            info!("Subscription stopped");
            Ok::<(), CourierError>(())
        }
        .instrument(span)
        .await
    }

    async fn handle_entry<H, Fut>(
        &self,
        session: &Arc<Session>,
        entry: StreamEntry,
        handler: &H,
    ) -> Result<()>
    where
        H: Fn(T, MessageHandle) -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send,
    {
        let decoded = Message::from_entry(&entry, self.max_retries).and_then(|message| {
            decode_payload(self.schema.as_ref(), &message.data, &self.topic, ValidationStage::Subscribe)
                .map(|payload| (message, payload))
        });

        let (message, payload) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => return self.reject(session, entry, e).await,
        };

        let delivery = Delivery {
            topic: self.topic.clone(),
            keys: self.keys.clone(),
            group: session.group.clone(),
            id: entry.id,
            message,
        };
        let handle = MessageHandle::new(delivery.clone(), Arc::clone(session));

        let outcome = AssertUnwindSafe(handler(payload, handle.clone()))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => FailureInfo::from_error(e.as_ref()),
            Err(panic) => FailureInfo::from_panic(panic.as_ref()),
        };

        metrics::record_handler_failure(&self.topic);
        warn!(
            msg_id = %delivery.id,
            retry_count = delivery.message.retry_count,
            error = %failure.message,
            "Handler failed"
        );

        if !handle.try_settle() {
            debug!(msg_id = %delivery.id, "Handler settled the message before failing");
            return Ok(());
        }
        session
            .retry
            .fail(&delivery, RetryOptions::default(), failure)
            .await?;
        Ok(())
    }

    /// Audit and drop an entry that cannot be decoded.
    async fn reject(&self, session: &Session, entry: StreamEntry, error: CourierError) -> Result<()> {
        metrics::record_decode_failure(&self.topic);
        warn!(msg_id = %entry.id, error = %error, "Skipping undecodable message");

        let message = Message::from_entry(&entry, self.max_retries).unwrap_or_else(|_| {
            Message::new(entry.field(crate::message::FIELD_DATA).unwrap_or_default(), self.max_retries)
        });
        let delivery = Delivery {
            topic: self.topic.clone(),
            keys: self.keys.clone(),
            group: session.group.clone(),
            id: entry.id,
            message,
        };
        session
            .retry
            .reject(&delivery, FailureInfo::new("DecodeError", error.to_string()))
            .await
    }
}
