// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - An in-memory harness with a manual clock
//! - Polling helpers for background subscription tasks

#![allow(dead_code)]

pub mod containers;

pub use containers::*;

use std::sync::Arc;
use std::time::Duration;
use stream_courier::config::CourierConfig;
use stream_courier::{Courier, ManualClock, MemoryStore};

/// Epoch millis the manual clock starts at.
pub const T0: u64 = 1_700_000_000_000;

/// One in-memory store and one clock shared by any number of couriers.
pub struct Harness {
    pub clock: ManualClock,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = ManualClock::new(T0);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        Self { clock, store }
    }

    pub fn config(&self, durable_name: &str) -> CourierConfig {
        CourierConfig::for_testing(durable_name)
    }

    /// A connected courier over the shared store.
    pub async fn courier(&self, durable_name: &str) -> Courier {
        self.courier_with(self.config(durable_name)).await
    }

    pub async fn courier_with(&self, config: CourierConfig) -> Courier {
        let courier =
            Courier::with_store_and_clock(config, self.store.clone(), Arc::new(self.clock.clone()))
                .unwrap();
        courier.connect().await.unwrap();
        courier
    }

    /// Poll `cond` while pushing the clock forward by `step` each round, so
    /// delayed retries and idle claims come due.
    pub async fn drive_until<F: FnMut() -> bool>(&self, step: Duration, cond: F) -> bool {
        let clock = self.clock.clone();
        poll_until(Duration::from_secs(5), cond, move || clock.advance(step)).await
    }
}

/// Wait (real time) until `cond` holds. Returns false on timeout.
pub async fn eventually<F: FnMut() -> bool>(cond: F) -> bool {
    poll_until(Duration::from_secs(5), cond, || {}).await
}

async fn poll_until<F, T>(limit: Duration, mut cond: F, mut tick: T) -> bool
where
    F: FnMut() -> bool,
    T: FnMut(),
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tick();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Let background tasks run for a short while.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
