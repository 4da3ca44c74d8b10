// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded pool of validated, reusable store connections.
//!
//! The pool is generic over a [`ConnectionFactory`], which knows how to
//! create, validate and destroy one connection. The Redis factory lives in
//! [`crate::store::redis`]; tests use in-process fakes.
//!
//! # Checkout Lifecycle
//!
//! ```text
//! acquire ──► idle? ──valid──► PooledConnection ──drop/release──► idle
//!               │      └invalid─► destroy (Reconnecting)
//!               └─ empty ─► size < max ? create : wait (by priority)
//! ```
//!
//! - A connection that fails validation is never handed out; it is destroyed
//!   and the slot reused.
//! - Waiters are served lowest priority number first, FIFO within a priority.
//! - A failed creation fails only that acquire; the pool keeps working.
//! - [`ConnectionPool::end()`] waits for outstanding checkouts, destroys
//!   everything and is idempotent.
//!
//! Lifecycle transitions are broadcast as [`PoolEvent`]s. Nobody has to
//! listen.

use crate::error::PoolError;
use crate::metrics;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, warn};

/// Priority used by [`ConnectionPool::acquire()`].
pub const DEFAULT_PRIORITY: u32 = 0;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Boxed future returned by [`ConnectionFactory::create`].
pub type CreateFuture<'a, C> = Pin<Box<dyn Future<Output = Result<C, PoolError>> + Send + 'a>>;

/// Knows how to make and check one kind of connection.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection.
    fn create(&self) -> CreateFuture<'_, Self::Connection>;

    /// Whether the connection is still in a live state.
    fn is_valid(&self, conn: &Self::Connection) -> bool;

    /// Tear down a connection. Dropping it is enough for most clients.
    fn destroy(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Observable pool lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A connection attempt started.
    Connect,
    /// A connection was created and is usable.
    Ready,
    /// A dead connection was found and is being replaced.
    Reconnecting,
    /// A connection attempt failed.
    Error(String),
    /// A connection was destroyed.
    Close,
    /// The pool was ended.
    End,
}

/// Pool sizing.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub min: usize,
    pub max: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min: 0,
            max: 20,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&crate::config::PoolConfig> for PoolOptions {
    fn from(config: &crate::config::PoolConfig) -> Self {
        Self {
            min: config.min_connections,
            max: config.max_connections.max(1),
            acquire_timeout: config.acquire_timeout_duration(),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Live connections, idle or checked out (including ones being created).
    pub size: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub waiting: usize,
}

struct Waiter {
    priority: u32,
    seq: u64,
    wake: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // BinaryHeap is a max-heap: the "greatest" waiter has the lowest
    // priority number, then the lowest sequence.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolState<C> {
    idle: VecDeque<C>,
    size: usize,
    checked_out: usize,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
    closing: bool,
    ended: bool,
}

impl<C> PoolState<C> {
    /// Wake the best waiter still listening.
    fn wake_next(&mut self) {
        while let Some(waiter) = self.waiters.pop() {
            if waiter.wake.send(()).is_ok() {
                return;
            }
        }
    }
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    options: PoolOptions,
    state: Mutex<PoolState<F::Connection>>,
    drained: Notify,
    events: broadcast::Sender<PoolEvent>,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<F::Connection>> {
        // A panic while holding the lock cannot leave the counters half
        // updated, so recover the guard.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    fn release(&self, conn: F::Connection) {
        let valid = self.factory.is_valid(&conn);
        let mut state = self.lock();
        state.checked_out = state.checked_out.saturating_sub(1);

        if state.closing || !valid {
            state.size = state.size.saturating_sub(1);
            let drained = state.checked_out == 0;
            state.wake_next();
            let size = state.size;
            drop(state);

            self.factory.destroy(conn);
            self.emit(PoolEvent::Close);
            metrics::set_pool_size(size);
            if drained {
                self.drained.notify_waiters();
            }
            return;
        }

        state.idle.push_back(conn);
        state.wake_next();
    }

    fn discard(&self, conn: F::Connection) {
        let mut state = self.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        state.size = state.size.saturating_sub(1);
        let drained = state.checked_out == 0;
        state.wake_next();
        let size = state.size;
        drop(state);

        self.factory.destroy(conn);
        self.emit(PoolEvent::Close);
        metrics::set_pool_size(size);
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Give back a slot reserved for a creation that did not produce a
    /// usable connection.
    fn abandon_slot(&self) {
        let mut state = self.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        state.size = state.size.saturating_sub(1);
        let drained = state.checked_out == 0;
        state.wake_next();
        drop(state);
        if drained {
            self.drained.notify_waiters();
        }
    }
}

/// A slot counted in `size` and `checked_out` before its connection exists.
/// Dropping it unfilled (a failed or cancelled creation) gives the slot back.
struct SlotReservation<'a, F: ConnectionFactory> {
    pool: &'a PoolInner<F>,
    filled: bool,
}

impl<'a, F: ConnectionFactory> SlotReservation<'a, F> {
    fn new(pool: &'a PoolInner<F>) -> Self {
        Self {
            pool,
            filled: false,
        }
    }

    fn fill(mut self) {
        self.filled = true;
    }
}

impl<F: ConnectionFactory> Drop for SlotReservation<'_, F> {
    fn drop(&mut self) {
        if !self.filled {
            self.pool.abandon_slot();
        }
    }
}

/// A place in the waiter queue. If the acquire is cancelled after being
/// woken, the wakeup is passed on so the freed connection is not stranded.
struct WaitTicket<'a, F: ConnectionFactory> {
    pool: &'a PoolInner<F>,
    wake: oneshot::Receiver<()>,
}

impl<F: ConnectionFactory> Drop for WaitTicket<'_, F> {
    fn drop(&mut self) {
        self.wake.close();
        let woken = self.wake.try_recv().is_ok();
        let mut state = self.pool.lock();
        state.waiters.retain(|w| !w.wake.is_closed());
        if woken {
            state.wake_next();
        }
    }
}

enum Step<C> {
    Ready(C),
    Create,
    Wait(oneshot::Receiver<()>),
}

/// A bounded, validated connection pool.
///
/// Cloning is cheap and shares the pool.
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool. No connections are opened until [`start()`](Self::start)
    /// or the first acquire.
    pub fn new(factory: F, options: PoolOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(PoolInner {
                factory,
                options,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    size: 0,
                    checked_out: 0,
                    waiters: BinaryHeap::new(),
                    next_seq: 0,
                    closing: false,
                    ended: false,
                }),
                drained: Notify::new(),
                events,
            }),
        }
    }

    /// Open connections until the pool holds at least `min`.
    pub async fn start(&self) -> Result<(), PoolError> {
        loop {
            {
                let mut state = self.inner.lock();
                if state.closing {
                    return Err(PoolError::Closed);
                }
                if state.size >= self.inner.options.min {
                    return Ok(());
                }
                state.size += 1;
                state.checked_out += 1;
            }
            let conn = self
                .create_connection(SlotReservation::new(&self.inner))
                .await?;
            self.inner.release(conn);
        }
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Current counters.
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        PoolStatus {
            size: state.size,
            idle: state.idle.len(),
            checked_out: state.checked_out,
            waiting: state.waiters.len(),
        }
    }

    /// Whether [`end()`](Self::end) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closing
    }

    /// Check out a connection with the default priority.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, PoolError> {
        self.acquire_with_priority(DEFAULT_PRIORITY).await
    }

    /// Check out a connection. Lower `priority` values are served first
    /// when callers have to wait.
    pub async fn acquire_with_priority(
        &self,
        priority: u32,
    ) -> Result<PooledConnection<F>, PoolError> {
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.inner.options.acquire_timeout,
            self.acquire_inner(priority),
        )
        .await
        .unwrap_or(Err(PoolError::Timeout));

        metrics::record_pool_acquire(started.elapsed(), result.is_ok());
        result
    }

    async fn acquire_inner(&self, priority: u32) -> Result<PooledConnection<F>, PoolError> {
        loop {
            let mut broken = Vec::new();
            let step = {
                let mut state = self.inner.lock();
                if state.closing {
                    return Err(PoolError::Closed);
                }

                let mut ready = None;
                while let Some(conn) = state.idle.pop_front() {
                    if self.inner.factory.is_valid(&conn) {
                        ready = Some(conn);
                        break;
                    }
                    state.size = state.size.saturating_sub(1);
                    broken.push(conn);
                }

                if let Some(conn) = ready {
                    state.checked_out += 1;
                    Step::Ready(conn)
                } else if state.size < self.inner.options.max {
                    state.size += 1;
                    state.checked_out += 1;
                    Step::Create
                } else {
                    let (tx, rx) = oneshot::channel();
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.waiters.push(Waiter {
                        priority,
                        seq,
                        wake: tx,
                    });
                    Step::Wait(rx)
                }
            };

            for conn in broken {
                debug!("Discarding pooled connection that failed validation");
                self.inner.emit(PoolEvent::Reconnecting);
                self.inner.factory.destroy(conn);
                self.inner.emit(PoolEvent::Close);
            }

            match step {
                Step::Ready(conn) => return Ok(self.wrap(conn)),
                Step::Create => {
                    let conn = self
                        .create_connection(SlotReservation::new(&self.inner))
                        .await?;
                    return Ok(self.wrap(conn));
                }
                Step::Wait(rx) => {
                    let mut ticket = WaitTicket {
                        pool: &self.inner,
                        wake: rx,
                    };
                    // Woken by a release, or the sender was dropped by end().
                    // Either way, re-check the state.
                    let _ = (&mut ticket.wake).await;
                }
            }
        }
    }

    /// Create a connection for a slot that is already reserved.
    async fn create_connection(
        &self,
        reservation: SlotReservation<'_, F>,
    ) -> Result<F::Connection, PoolError> {
        self.inner.emit(PoolEvent::Connect);
        match self.inner.factory.create().await {
            Ok(conn) if self.inner.factory.is_valid(&conn) => {
                reservation.fill();
                self.inner.emit(PoolEvent::Ready);
                let size = self.inner.lock().size;
                metrics::set_pool_size(size);
                debug!(size, "Created pooled connection");
                Ok(conn)
            }
            Ok(conn) => {
                self.inner.factory.destroy(conn);
                drop(reservation);
                let message = "new connection failed validation".to_string();
                warn!(error = %message, "Pool connection creation failed");
                self.inner.emit(PoolEvent::Error(message.clone()));
                Err(PoolError::Create(message))
            }
            Err(e) => {
                drop(reservation);
                warn!(error = %e, "Pool connection creation failed");
                self.inner.emit(PoolEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    fn wrap(&self, conn: F::Connection) -> PooledConnection<F> {
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Return a connection. Equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection<F>) {
        conn.release();
    }

    /// Destroy a checked-out connection instead of returning it.
    pub fn destroy(&self, conn: PooledConnection<F>) {
        conn.discard();
    }

    /// Drain and close the pool.
    ///
    /// Pending acquires fail with [`PoolError::Closed`], outstanding
    /// checkouts are waited for, and every connection is destroyed.
    /// Calling this again is a no-op.
    pub async fn end(&self) {
        let idle: Vec<F::Connection> = {
            let mut state = self.inner.lock();
            if state.ended {
                return;
            }
            state.closing = true;
            // Dropping the senders wakes every waiter; they observe `closing`.
            state.waiters.clear();
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.size = state.size.saturating_sub(idle.len());
            idle
        };

        for conn in idle {
            self.inner.factory.destroy(conn);
            self.inner.emit(PoolEvent::Close);
        }

        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().checked_out == 0 {
                break;
            }
            notified.await;
        }

        let first = {
            let mut state = self.inner.lock();
            let first = !state.ended;
            state.ended = true;
            first
        };
        if first {
            metrics::set_pool_size(0);
            debug!("Connection pool ended");
            self.inner.emit(PoolEvent::End);
        }
    }
}

/// A checked-out connection. Returns itself to the pool when dropped.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<F::Connection>,
    pool: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Return the connection to the pool.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }

    /// Destroy the connection instead of returning it.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("checked_out", &self.conn.is_some())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `release`/`discard`/`drop` take the connection, and they
        // consume the guard.
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
