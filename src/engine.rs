// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Courier facade and lifecycle.
//!
//! [`Courier`] owns the liveness flag, the store session and the consumer
//! identity. Topic handles ([`Event`], [`Service`]) are cheap to create and
//! do no I/O until first use; they read the current session on every call,
//! so handles created before `connect()` work once it completes.
//!
//! # State Transitions
//!
//! ```text
//!              connect()
//! Created ─────────────────→ Connecting ──→ Running
//!                                  ↑           │
//!                       connect()  │           │ disconnect()
//!                                  │           ↓
//!                               Stopped ←── ShuttingDown
//! ```
//!
//! Each `connect()` picks a fresh consumer identity. `disconnect()` flips the
//! liveness flag, waits `shutdown_grace` for polls to observe it, puts every
//! entry the consumer still holds back on its stream, removes the consumer
//! from every group under the namespace, then closes the store.

use crate::bus::Event;
use crate::clock::{Clock, SystemClock};
use crate::config::{Backend, CourierConfig};
use crate::error::{CourierError, Result};
use crate::metrics;
use crate::retry::RetryEngine;
use crate::schema::Schema;
use crate::service::Service;
use crate::source::SourceOptions;
use crate::store::{EntryId, MemoryStore, RedisStore, StreamStore};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Lifecycle state of a [`Courier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, never connected.
    Created,
    /// `connect()` in progress.
    Connecting,
    /// Connected and alive.
    Running,
    /// `disconnect()` in progress.
    ShuttingDown,
    /// Disconnected. May be connected again.
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Connecting => write!(f, "Connecting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Generate a consumer identity: 16 random bytes, hex encoded.
pub fn generate_consumer_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Everything bound at `connect()` and released at `disconnect()`.
pub(crate) struct Session {
    pub store: Arc<dyn StreamStore>,
    pub clock: Arc<dyn Clock>,
    pub retry: RetryEngine,
    pub group: String,
    pub consumer: String,
    pub source_options: SourceOptions,
    /// Whether the courier built the store (and so closes it).
    owned: bool,
}

pub(crate) struct CourierInner {
    pub config: CourierConfig,
    clock: Arc<dyn Clock>,
    store_override: Option<Arc<dyn StreamStore>>,
    session: RwLock<Option<Arc<Session>>>,
    lifecycle: Mutex<()>,
    alive: watch::Sender<bool>,
    state: watch::Sender<EngineState>,
}

impl CourierInner {
    /// Current session, or `NotConnected`.
    pub fn session(&self) -> Result<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(CourierError::NotConnected)
    }

    fn set_session(&self, session: Option<Arc<Session>>) {
        *self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = session;
    }

    pub fn alive_receiver(&self) -> watch::Receiver<bool> {
        self.alive.subscribe()
    }

    fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
    }
}

/// Entry point: connects to the store and hands out topic handles.
///
/// Clones share the same connection and liveness.
#[derive(Clone)]
pub struct Courier {
    inner: Arc<CourierInner>,
}

impl std::fmt::Debug for Courier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Courier")
            .field("durable_name", &self.inner.config.durable_name)
            .field("state", &self.state())
            .finish()
    }
}

impl Courier {
    /// Create a courier. The backend is chosen from `config.backend` on
    /// `connect()`.
    pub fn new(config: CourierConfig) -> Result<Self> {
        Self::build(config, None, Arc::new(SystemClock))
    }

    /// Create a courier over an existing store.
    ///
    /// The store is shared, not owned: `disconnect()` leaves it open so
    /// several couriers can run against one in-process store.
    pub fn with_store(config: CourierConfig, store: Arc<dyn StreamStore>) -> Result<Self> {
        Self::build(config, Some(store), Arc::new(SystemClock))
    }

    /// Like [`with_store`](Self::with_store), with a custom clock.
    pub fn with_store_and_clock(
        config: CourierConfig,
        store: Arc<dyn StreamStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::build(config, Some(store), clock)
    }

    fn build(
        config: CourierConfig,
        store_override: Option<Arc<dyn StreamStore>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let (alive, _) = watch::channel(false);
        let (state, _) = watch::channel(EngineState::Created);
        Ok(Self {
            inner: Arc::new(CourierInner {
                config,
                clock,
                store_override,
                session: RwLock::new(None),
                lifecycle: Mutex::new(()),
                alive,
                state,
            }),
        })
    }

    pub fn config(&self) -> &CourierConfig {
        &self.inner.config
    }

    /// The consumer group every topic is read through.
    pub fn group(&self) -> &str {
        &self.inner.config.durable_name
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    /// Whether polls should keep going.
    pub fn is_alive(&self) -> bool {
        *self.inner.alive.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session().is_ok()
    }

    /// Consumer identity of the current session.
    pub fn consumer_id(&self) -> Option<String> {
        self.inner.session().ok().map(|s| s.consumer.clone())
    }

    /// The store of the current session.
    pub fn store(&self) -> Result<Arc<dyn StreamStore>> {
        Ok(Arc::clone(&self.inner.session()?.store))
    }

    /// Connect to the store and mark the courier alive. No-op if connected.
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.session().is_ok() {
            debug!("Already connected");
            return Ok(());
        }

        let config = &self.inner.config;
        info!(
            group = %config.durable_name,
            namespace = %config.namespace,
            backend = ?config.backend,
            "Connecting courier"
        );
        let previous = self.state();
        self.inner.set_state(EngineState::Connecting);

        let built: Result<(Arc<dyn StreamStore>, bool)> = match &self.inner.store_override {
            Some(store) => Ok((Arc::clone(store), false)),
            None => match config.backend {
                Backend::Redis => match RedisStore::connect(config).await {
                    Ok(store) => Ok((Arc::new(store) as Arc<dyn StreamStore>, true)),
                    Err(e) => Err(e),
                },
                Backend::Memory => Ok((
                    Arc::new(MemoryStore::new(Arc::clone(&self.inner.clock))) as Arc<dyn StreamStore>,
                    true,
                )),
            },
        };
        let (store, owned) = match built {
            Ok(built) => built,
            Err(e) => {
                warn!(error = %e, "Courier failed to connect");
                self.inner.set_state(previous);
                return Err(e);
            }
        };

        let clock = Arc::clone(&self.inner.clock);
        let consumer = generate_consumer_id();
        let session = Session {
            retry: RetryEngine::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                config.retry.backoff_base_duration(),
            ),
            store,
            clock,
            group: config.durable_name.clone(),
            consumer: consumer.clone(),
            source_options: SourceOptions::from_config(&config.source),
            owned,
        };

        self.inner.set_session(Some(Arc::new(session)));
        self.inner.alive.send_replace(true);
        self.inner.set_state(EngineState::Running);
        metrics::set_connected(true);
        info!(consumer = %consumer, "Courier connected");
        Ok(())
    }

    /// Stop every poll, deregister the consumer and close the store.
    /// No-op if not connected.
    ///
    /// Deregistration is best effort: failures are logged and the
    /// disconnect completes.
    pub async fn disconnect(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let Ok(session) = self.inner.session() else {
            debug!("Already disconnected");
            return Ok(());
        };

        info!(consumer = %session.consumer, "Disconnecting courier");
        self.inner.set_state(EngineState::ShuttingDown);
        self.inner.alive.send_replace(false);

        tokio::time::sleep(self.inner.config.shutdown_grace_duration()).await;

        let removed = self.release_membership(&session).await;
        debug!(groups = removed, "Consumer deregistered");

        if session.owned {
            if let Err(e) = session.store.close().await {
                warn!(error = %e, "Failed to close store");
            }
        }

        self.inner.set_session(None);
        self.inner.set_state(EngineState::Stopped);
        metrics::set_connected(false);
        info!("Courier disconnected");
        Ok(())
    }

    /// Hand back this consumer's pending entries and remove it from the
    /// group on every stream under the namespace. Returns how many
    /// registrations were removed.
    ///
    /// A key whose entries could not be handed back keeps the registration,
    /// so the entries stay claimable by the rest of the group.
    async fn release_membership(&self, session: &Session) -> usize {
        let keys = match session.store.list_keys(&self.inner.config.namespace).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list keys; consumer left registered");
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            match hand_back_pending(session, &key).await {
                Ok(0) => {}
                Ok(count) => info!(key = %key, count, "Handed back unacknowledged entries"),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to hand back pending entries; consumer left registered");
                    continue;
                }
            }
            match session
                .store
                .deregister_consumer(&key, &session.group, &session.consumer)
                .await
            {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "Failed to deregister consumer"),
            }
        }
        removed
    }

    /// Bind a topic to a payload schema.
    ///
    /// Messages get `retry.default_max_retries` unless overridden with
    /// [`Event::with_max_retries`] or per publish.
    pub fn register_event<T, S>(&self, topic: &str, schema: S) -> Event<T>
    where
        T: Send + 'static,
        S: Schema<T>,
    {
        Event::new(
            Arc::clone(&self.inner),
            topic,
            Arc::new(schema),
            self.inner.config.retry.default_max_retries,
        )
    }

    /// Bind a request/reply service to request and response schemas.
    pub fn register_service<Req, Res, RqS, RsS>(
        &self,
        topic: &str,
        request_schema: RqS,
        response_schema: RsS,
    ) -> Service<Req, Res>
    where
        Req: Serialize + Send + 'static,
        Res: Serialize + Send + 'static,
        RqS: Schema<Req>,
        RsS: Schema<Res>,
    {
        Service::new(
            Arc::clone(&self.inner),
            topic,
            Arc::new(request_schema),
            Arc::new(response_schema),
        )
    }
}

const HAND_BACK_BATCH: usize = 100;

/// Re-append every entry pending for this consumer on `key`, fields
/// untouched, and acknowledge the originals. Removing a consumer from a
/// group discards its pending list, so anything read but never settled has
/// to go back on the stream first. Entries deleted from the stream are
/// only acknowledged.
async fn hand_back_pending(session: &Session, key: &str) -> Result<usize> {
    let store = &session.store;
    let mut handed = 0;
    loop {
        let batch = store
            .read_pending(key, &session.group, &session.consumer, HAND_BACK_BATCH)
            .await?;
        if batch.is_empty() {
            return Ok(handed);
        }

        let mut ids = Vec::with_capacity(batch.len());
        for entry in batch {
            if !entry.fields.is_empty() {
                store.append(key, EntryId::Auto, entry.fields).await?;
                handed += 1;
            }
            ids.push(entry.id);
        }
        store.ack(key, &session.group, &ids).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::schema::Json;
    use crate::store::TopicKeys;

    fn memory_courier() -> (Courier, Arc<MemoryStore>) {
        let clock = ManualClock::new(1_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let courier = Courier::with_store_and_clock(
            CourierConfig::for_testing("engine-tests"),
            store.clone(),
            Arc::new(clock),
        )
        .unwrap();
        (courier, store)
    }

    #[test]
    fn test_consumer_id_shape() {
        let id = generate_consumer_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_consumer_id());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = CourierConfig {
            durable_name: String::new(),
            ..Default::default()
        };
        assert!(matches!(Courier::new(config), Err(CourierError::Config(_))));
    }

    #[test]
    fn test_initial_state() {
        let (courier, _) = memory_courier();
        assert_eq!(courier.state(), EngineState::Created);
        assert!(!courier.is_alive());
        assert!(!courier.is_connected());
        assert!(courier.consumer_id().is_none());
        assert_eq!(courier.group(), "engine-tests");
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let (courier, _) = memory_courier();
        let event = courier.register_event::<u32, _>("numbers", Json::<u32>::new());
        assert!(matches!(event.publish(&1).await, Err(CourierError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (courier, _) = memory_courier();
        courier.connect().await.unwrap();
        let first = courier.consumer_id().unwrap();
        courier.connect().await.unwrap();
        assert_eq!(courier.consumer_id().unwrap(), first);
        assert_eq!(courier.state(), EngineState::Running);
        assert!(courier.is_alive());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_reconnect_gets_new_identity() {
        let (courier, _) = memory_courier();
        courier.disconnect().await.unwrap();
        assert_eq!(courier.state(), EngineState::Created);

        courier.connect().await.unwrap();
        let first = courier.consumer_id().unwrap();
        courier.disconnect().await.unwrap();
        courier.disconnect().await.unwrap();
        assert_eq!(courier.state(), EngineState::Stopped);
        assert!(!courier.is_alive());

        courier.connect().await.unwrap();
        assert_ne!(courier.consumer_id().unwrap(), first);
    }

    #[tokio::test]
    async fn test_disconnect_deregisters_consumer() {
        let (courier, store) = memory_courier();
        courier.connect().await.unwrap();
        let consumer = courier.consumer_id().unwrap();
        let keys = TopicKeys::new(&courier.config().namespace, "numbers");

        let session = courier.inner.session().unwrap();
        session
            .store
            .create_group_if_absent(&keys.stream, courier.group())
            .await
            .unwrap();
        session
            .store
            .read_new(&keys.stream, courier.group(), &consumer, 1, None)
            .await
            .unwrap();
        assert_eq!(store.consumers(&keys.stream, courier.group()), vec![consumer]);

        courier.disconnect().await.unwrap();
        assert!(store.consumers(&keys.stream, courier.group()).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_hands_back_unsettled_entries() {
        let (courier, store) = memory_courier();
        courier.connect().await.unwrap();
        let consumer = courier.consumer_id().unwrap();
        let keys = TopicKeys::new(&courier.config().namespace, "numbers");
        let group = courier.group().to_string();

        let mut held = crate::message::Message::new("7", 5);
        held.retry_count = 2;
        store.create_group_if_absent(&keys.stream, &group).await.unwrap();
        store
            .append(&keys.stream, EntryId::Auto, held.to_fields())
            .await
            .unwrap();
        store
            .append(&keys.stream, EntryId::Auto, crate::message::Message::new("8", 5).to_fields())
            .await
            .unwrap();
        let read = store
            .read_new(&keys.stream, &group, &consumer, 1, None)
            .await
            .unwrap();
        assert_eq!(store.pending_count(&keys.stream, &group), 1);

        courier.disconnect().await.unwrap();

        // The held entry is acknowledged and appended again, counters intact.
        assert_eq!(store.pending_count(&keys.stream, &group), 0);
        assert!(store.consumers(&keys.stream, &group).is_empty());
        let entries = store.entries(&keys.stream);
        assert_eq!(entries.len(), 3);
        let copy = &entries[2];
        assert_ne!(copy.id, read[0].id);
        let message = crate::message::Message::from_entry(copy, 3).unwrap();
        assert_eq!(message.data, "7");
        assert_eq!(message.retry_count, 2);
        assert_eq!(message.max_retries, 5);

        // A new member of the group sees both entries not yet settled.
        let next = store
            .read_new(&keys.stream, &group, "successor", 10, None)
            .await
            .unwrap();
        let data: Vec<_> = next.iter().filter_map(|e| e.field("data")).collect();
        assert_eq!(data, vec!["8", "7"]);
    }

    #[tokio::test]
    async fn test_shared_store_survives_disconnect() {
        let (courier, store) = memory_courier();
        courier.connect().await.unwrap();
        let event = courier.register_event::<u32, _>("numbers", Json::<u32>::new());
        event.publish(&7).await.unwrap();
        courier.disconnect().await.unwrap();

        courier.connect().await.unwrap();
        event.publish(&8).await.unwrap();
        assert_eq!(store.stream_len(&event.keys().stream), 2);
    }

    #[tokio::test]
    async fn test_state_receiver_sees_transitions() {
        let (courier, _) = memory_courier();
        let rx = courier.state_receiver();
        courier.connect().await.unwrap();
        assert_eq!(*rx.borrow(), EngineState::Running);
        courier.disconnect().await.unwrap();
        assert_eq!(*rx.borrow(), EngineState::Stopped);
    }

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
    }
}
