// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request/reply over a pair of streams.
//!
//! A service topic `T` carries requests; `T-res` carries responses tagged
//! with `reqMsgId`, the entry id of the request they answer.
//!
//! # Request Flow
//!
//! ```text
//! request(payload)
//!   ├─ validate + append to T           → request id
//!   ├─ register request id with router
//!   └─ pull T-res one entry at a time
//!        ├─ tagged with my id (or untagged) → validate, ack, return
//!        ├─ tagged for another waiter here  → hand over through the router
//!        └─ unknown id                      → park (may be a request that
//!                                             has not registered yet)
//! ```
//!
//! Parked responses that nobody here picks up within one claim-idle window
//! are released: they stay pending so the instance that sent the request can
//! claim them. After [`ORPHAN_PARK_LIMIT`] releases a response is considered
//! orphaned (its requester is gone) and is acknowledged and dropped.
//!
//! Responses are consumed by the courier's durable group, so every instance
//! of a service shares one response cursor.

use crate::bus::{decode_payload, encode_payload, Event, MessageHandle};
use crate::engine::CourierInner;
use crate::error::{BoxError, CourierError, Result, ValidationStage};
use crate::message::{Message, ResponseMessage};
use crate::metrics;
use crate::schema::Schema;
use crate::source::{MessageSource, Subscription};
use crate::store::{EntryId, StreamEntry, TopicKeys};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info_span, trace, warn, Instrument};

/// Times a response may be parked and released before it is dropped.
pub const ORPHAN_PARK_LIMIT: u32 = 3;

/// A response taken off the stream, still pending.
#[derive(Debug, Clone)]
pub(crate) struct Routed {
    pub entry_id: String,
    pub response: ResponseMessage,
}

#[derive(Debug)]
struct Parked {
    routed: Routed,
    parked_at: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Route {
    /// The response belongs to the caller.
    Mine,
    /// Delivered to another in-process waiter.
    Handed,
    /// Nobody here is waiting for it yet.
    Parked,
}

/// What a requester gets when it registers.
pub(crate) enum Registration {
    /// The response arrived before registration.
    Ready(Routed),
    Waiting(oneshot::Receiver<Routed>),
}

/// How often an entry has been released, and when it last was.
#[derive(Debug, Clone, Copy)]
struct Released {
    count: u32,
    last_at: u64,
}

#[derive(Default)]
struct RouterState {
    waiters: HashMap<String, oneshot::Sender<Routed>>,
    parked: HashMap<String, Parked>,
    releases: HashMap<String, Released>,
}

/// Matches responses to in-process requesters by request id.
#[derive(Default)]
pub(crate) struct ResponseRouter {
    state: Mutex<RouterState>,
}

impl ResponseRouter {
    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, request_id: &str) -> Registration {
        let mut state = self.lock();
        if let Some(parked) = state.parked.remove(request_id) {
            state.releases.remove(&parked.routed.entry_id);
            return Registration::Ready(parked.routed);
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(request_id.to_string(), tx);
        Registration::Waiting(rx)
    }

    pub fn deregister(&self, request_id: &str) {
        self.lock().waiters.remove(request_id);
    }

    /// Decide who gets a response pulled by the requester `own_id`.
    pub fn route(&self, own_id: &str, routed: Routed, now: u64) -> Route {
        let target = match routed.response.req_msg_id.as_deref() {
            None => return Route::Mine,
            Some(id) if id == own_id => return Route::Mine,
            Some(id) => id.to_string(),
        };

        let mut state = self.lock();
        if let Some(waiter) = state.waiters.remove(&target) {
            match waiter.send(routed) {
                Ok(()) => return Route::Handed,
                // The waiter gave up between lookup and send; park it.
                Err(routed) => {
                    state.parked.insert(target, Parked { routed, parked_at: now });
                    return Route::Parked;
                }
            }
        }
        state.parked.insert(target, Parked { routed, parked_at: now });
        Route::Parked
    }

    /// Release parked responses older than `ttl_millis`.
    ///
    /// Returns entry ids that have been released too often and should be
    /// acknowledged and dropped. Release counts not touched for
    /// `ORPHAN_PARK_LIMIT` windows are forgotten: the entry was settled
    /// elsewhere.
    pub fn sweep(&self, now: u64, ttl_millis: u64) -> Vec<String> {
        let mut state = self.lock();
        let forget_after = ttl_millis.saturating_mul(u64::from(ORPHAN_PARK_LIMIT));
        state
            .releases
            .retain(|_, r| now.saturating_sub(r.last_at) < forget_after);

        let expired: Vec<String> = state
            .parked
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.parked_at) >= ttl_millis)
            .map(|(id, _)| id.clone())
            .collect();

        let mut orphans = Vec::new();
        for request_id in expired {
            if let Some(parked) = state.parked.remove(&request_id) {
                let entry_id = parked.routed.entry_id;
                let released = state.releases.entry(entry_id.clone()).or_insert(Released {
                    count: 0,
                    last_at: now,
                });
                released.count += 1;
                released.last_at = now;
                if released.count >= ORPHAN_PARK_LIMIT {
                    state.releases.remove(&entry_id);
                    orphans.push(entry_id);
                }
            }
        }
        orphans
    }

    #[cfg(test)]
    fn parked_len(&self) -> usize {
        self.lock().parked.len()
    }

    #[cfg(test)]
    fn tracked_releases(&self) -> usize {
        self.lock().releases.len()
    }
}

/// Request metadata passed to reply handlers.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    /// Entry id of the request; responses are tagged with it.
    pub request_id: String,
    pub retry_count: u32,
}

/// Typed request/reply handle for one service topic.
pub struct Service<Req, Res> {
    topic: String,
    response_keys: TopicKeys,
    requests: Event<Req>,
    req_schema: Arc<dyn Schema<Req>>,
    res_schema: Arc<dyn Schema<Res>>,
    courier: Arc<CourierInner>,
    router: Arc<ResponseRouter>,
}

impl<Req, Res> Clone for Service<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            response_keys: self.response_keys.clone(),
            requests: self.requests.clone(),
            req_schema: Arc::clone(&self.req_schema),
            res_schema: Arc::clone(&self.res_schema),
            courier: Arc::clone(&self.courier),
            router: Arc::clone(&self.router),
        }
    }
}

impl<Req, Res> Service<Req, Res>
where
    Req: Serialize + Send + 'static,
    Res: Serialize + Send + 'static,
{
    pub(crate) fn new(
        courier: Arc<CourierInner>,
        topic: &str,
        req_schema: Arc<dyn Schema<Req>>,
        res_schema: Arc<dyn Schema<Res>>,
    ) -> Self {
        let reply_max_retries = courier.config.service.reply_max_retries;
        Self {
            topic: topic.to_string(),
            response_keys: TopicKeys::responses(&courier.config.namespace, topic),
            requests: Event::new(
                Arc::clone(&courier),
                topic,
                Arc::clone(&req_schema),
                reply_max_retries,
            ),
            req_schema,
            res_schema,
            courier,
            router: Arc::new(ResponseRouter::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Send a request and wait for its response.
    ///
    /// Waits while the courier is alive, bounded by
    /// `service.request_timeout` when set.
    pub async fn request(&self, payload: &Req) -> Result<Res> {
        let started = Instant::now();
        let result = self.request_inner(payload).await;
        metrics::record_request(&self.topic, started.elapsed(), result.is_ok());
        result
    }

    async fn request_inner(&self, payload: &Req) -> Result<Res> {
        let data = encode_payload(self.req_schema.as_ref(), payload, &self.topic, ValidationStage::Request)?;
        let session = self.courier.session()?;

        // The group must exist before the reply can be appended, or a fresh
        // group would start past it.
        session
            .store
            .create_group_if_absent(&self.response_keys.stream, &session.group)
            .await?;

        let message = Message::new(data, self.courier.config.service.reply_max_retries);
        let request_id = session
            .store
            .append(&self.requests.keys().stream, EntryId::Auto, message.to_fields())
            .await?;
        metrics::record_published(&self.topic);
        debug!(topic = %self.topic, request_id = %request_id, "Sent request");

        let registration = self.router.register(&request_id);
        let wait = self.await_response(&request_id, registration);
        let outcome = match self.courier.config.service.request_timeout_duration() {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or_else(|_| {
                Err(CourierError::request(&self.topic, format!("no response within {:?}", limit)))
            }),
            None => wait.await,
        };
        self.router.deregister(&request_id);
        if let Err(e) = self.drop_orphans(&session).await {
            warn!(topic = %self.topic, error = %e, "Failed to drop orphaned responses");
        }

        let routed = outcome?;
        session
            .store
            .ack(
                &self.response_keys.stream,
                &session.group,
                std::slice::from_ref(&routed.entry_id),
            )
            .await?;

        decode_payload(
            self.res_schema.as_ref(),
            &routed.response.data,
            &self.topic,
            ValidationStage::Response,
        )
    }

    async fn await_response(&self, request_id: &str, registration: Registration) -> Result<Routed> {
        let mut rx = match registration {
            Registration::Ready(routed) => return Ok(routed),
            Registration::Waiting(rx) => rx,
        };

        let session = self.courier.session()?;
        let mut source = MessageSource::new(
            Arc::clone(&session.store),
            Arc::clone(&session.clock),
            Subscription {
                topic: format!("{}-res", self.topic),
                keys: self.response_keys.clone(),
                group: session.group.clone(),
                consumer: session.consumer.clone(),
            },
            session.source_options.clone().one_at_a_time(),
            self.courier.alive_receiver(),
        );

        loop {
            let entry = tokio::select! {
                routed = &mut rx => {
                    return routed.map_err(|_| CourierError::request(&self.topic, "response router closed"));
                }
                next = source.next() => next?,
            };

            let Some(entry) = entry else {
                return Err(CourierError::request(
                    &self.topic,
                    "courier stopped before a response arrived",
                ));
            };

            let routed = match self.parse_response(&session, entry).await? {
                Some(routed) => routed,
                None => continue,
            };

            let now = session.clock.now_millis();
            match self.router.route(request_id, routed.clone(), now) {
                Route::Mine => return Ok(routed),
                Route::Handed => trace!(entry_id = %routed.entry_id, "Handed response to another waiter"),
                Route::Parked => trace!(entry_id = %routed.entry_id, "Parked response for an unknown request"),
            }

            self.drop_orphans(&session).await?;
        }
    }

    /// Release expired parked responses and acknowledge the orphans among
    /// them.
    async fn drop_orphans(&self, session: &crate::engine::Session) -> Result<()> {
        let ttl = u64::try_from(session.source_options.claim_min_idle.as_millis()).unwrap_or(u64::MAX);
        let orphans = self.router.sweep(session.clock.now_millis(), ttl);
        if !orphans.is_empty() {
            warn!(topic = %self.topic, count = orphans.len(), "Dropping orphaned responses");
            session
                .store
                .ack(&self.response_keys.stream, &session.group, &orphans)
                .await?;
        }
        Ok(())
    }

    /// Decode a response entry. Entries without a payload are dropped.
    async fn parse_response(
        &self,
        session: &crate::engine::Session,
        entry: StreamEntry,
    ) -> Result<Option<Routed>> {
        match ResponseMessage::from_entry(&entry) {
            Ok(response) => Ok(Some(Routed {
                entry_id: entry.id,
                response,
            })),
            Err(e) => {
                warn!(topic = %self.topic, entry_id = %entry.id, error = %e, "Dropping malformed response");
                session
                    .store
                    .ack(&self.response_keys.stream, &session.group, std::slice::from_ref(&entry.id))
                    .await?;
                Ok(None)
            }
        }
    }

    /// Serve requests until the courier disconnects.
    ///
    /// The handler's response is validated, the request acknowledged, then
    /// the response appended to the response stream. A failing handler or
    /// invalid response goes through the usual retry path.
    pub async fn reply<H, Fut>(&self, handler: H) -> Result<()>
    where
        H: Fn(Req, ReplyContext) -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<Res, BoxError>> + Send,
    {
        let session = self.courier.session()?;
        let span = info_span!("reply", topic = %self.topic);

        let handler = &handler;
        let session = &session;
        self.requests
            .subscribe(move |request: Req, msg: MessageHandle| {
                let context = ReplyContext {
                    request_id: msg.id().to_string(),
                    retry_count: msg.retry_count(),
                };
                let pending = handler(request, context);
                async move {
                    let response = pending.await?;
                    let data = encode_payload(
                        self.res_schema.as_ref(),
                        &response,
                        &self.topic,
                        ValidationStage::Reply,
                    )?;
                    msg.ack().await?;
                    let reply = ResponseMessage {
                        data,
                        req_msg_id: Some(msg.id().to_string()),
                    };
                    session
                        .store
                        .append(&self.response_keys.stream, EntryId::Auto, reply.to_fields())
                        .await?;
                    trace!(request_id = %msg.id(), "Replied");
                    Ok::<(), BoxError>(())
                }
            })
            .instrument(span)
            .await
    }
}
