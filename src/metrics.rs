// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Publishing and delivery throughput per topic
//! - Retry dispositions and dead-lettering
//! - Stale-message recovery (claims) and delay-queue promotions
//! - Connection pool health
//! - Request/reply latency
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `courier_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Nothing is recorded unless the application installs a recorder.
//!
//! # Usage
//!
//! ```rust,no_run
//! use stream_courier::metrics;
//! use std::time::Duration;
//!
//! // In the source after a read
//! metrics::record_delivered("orders", 10);
//!
//! // In the pool after a checkout
//! metrics::record_pool_acquire(Duration::from_micros(40), true);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a message published to a topic.
pub fn record_published(topic: &str) {
    counter!("courier_published_total", "topic" => topic.to_string()).increment(1);
}

/// Record messages handed to a subscriber (read or claimed).
pub fn record_delivered(topic: &str, count: usize) {
    if count > 0 {
        counter!("courier_delivered_total", "topic" => topic.to_string()).increment(count as u64);
    }
}

/// Record stale messages reclaimed from another consumer.
pub fn record_claimed(topic: &str, count: usize) {
    if count > 0 {
        counter!("courier_claimed_total", "topic" => topic.to_string()).increment(count as u64);
    }
}

/// Record due delay-queue entries moved back onto the live stream.
pub fn record_scheduled_promotions(topic: &str, count: usize) {
    if count > 0 {
        counter!("courier_scheduled_promotions_total", "topic" => topic.to_string())
            .increment(count as u64);
    }
}

/// Record a successful acknowledgement.
pub fn record_acked(topic: &str) {
    counter!("courier_acked_total", "topic" => topic.to_string()).increment(1);
}

/// Record a retry disposition (`immediate`, `at`, `exponential_backoff`).
pub fn record_retry(topic: &str, strategy: &str) {
    counter!(
        "courier_retries_total",
        "topic" => topic.to_string(),
        "strategy" => strategy.to_string()
    )
    .increment(1);
}

/// Record a message moved to the dead-letter queue.
pub fn record_dead_lettered(topic: &str) {
    counter!("courier_dead_lettered_total", "topic" => topic.to_string()).increment(1);
}

/// Record a handler that returned an error or panicked.
pub fn record_handler_failure(topic: &str) {
    counter!("courier_handler_failures_total", "topic" => topic.to_string()).increment(1);
}

/// Record an inbound entry that could not be decoded or validated.
pub fn record_decode_failure(topic: &str) {
    counter!("courier_decode_failures_total", "topic" => topic.to_string()).increment(1);
}

/// Record a store command failure by operation.
pub fn record_store_error(operation: &str) {
    counter!("courier_store_errors_total", "operation" => operation.to_string()).increment(1);
}

/// Record store command latency by operation.
pub fn record_store_latency(operation: &str, duration: Duration) {
    histogram!(
        "courier_store_operation_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a pool checkout attempt and how long it waited.
pub fn record_pool_acquire(wait: Duration, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("courier_pool_acquires_total", "status" => status).increment(1);
    histogram!("courier_pool_acquire_duration_seconds").record(wait.as_secs_f64());
}

/// Gauge for live pooled connections.
pub fn set_pool_size(size: usize) {
    gauge!("courier_pool_connections").set(size as f64);
}

/// Record a completed request/reply round trip.
pub fn record_request(topic: &str, duration: Duration, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "courier_requests_total",
        "topic" => topic.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("courier_request_duration_seconds", "topic" => topic.to_string())
        .record(duration.as_secs_f64());
}

/// Gauge for active subscription loops.
pub fn set_active_subscriptions(topic: &str, count: usize) {
    gauge!("courier_active_subscriptions", "topic" => topic.to_string()).set(count as f64);
}

/// Gauge for engine liveness (1 = connected).
pub fn set_connected(connected: bool) {
    gauge!("courier_connected").set(if connected { 1.0 } else { 0.0 });
}
