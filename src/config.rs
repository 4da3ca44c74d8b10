// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the courier.
//!
//! Configuration is passed to [`Courier::new()`](crate::Courier::new) and can
//! be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use stream_courier::config::CourierConfig;
//!
//! let config = CourierConfig {
//!     durable_name: "billing".into(),
//!     redis_url: "redis://cache:6379".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! CourierConfig
//! ├── durable_name: String       # Consumer group, stable across restarts
//! ├── namespace: String          # Key prefix for every stream and queue
//! ├── redis_url: String
//! ├── backend: redis | memory
//! ├── pool: PoolConfig           # Connection pool bounds and timeouts
//! ├── source: SourceConfig       # Read/claim batching
//! ├── retry: RetryConfig         # Default max retries, backoff base
//! ├── service: ServiceConfig     # Request/reply settings
//! └── shutdown_grace: "100ms"
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! durable_name: "billing"
//! redis_url: "redis://cache:6379"
//! pool:
//!   max_connections: 20
//!   acquire_timeout: "10s"
//! source:
//!   read_count: 10
//!   claim_min_idle: "5s"
//! retry:
//!   default_max_retries: 3
//! ```

use crate::error::{CourierError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Courier::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Consumer group name. Every process using the same durable name shares
    /// delivery of each topic.
    pub durable_name: String,

    /// Prefix applied to every key the courier touches.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Redis URL, e.g. `"redis://localhost:6379"`.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Which store implementation to build on `connect()`.
    #[serde(default)]
    pub backend: Backend,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    /// How long `disconnect()` waits for in-flight polls to observe shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
}

fn default_namespace() -> String {
    "hermes:".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_shutdown_grace() -> String {
    "100ms".to_string()
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            durable_name: "courier".to_string(),
            namespace: default_namespace(),
            redis_url: default_redis_url(),
            backend: Backend::Redis,
            pool: PoolConfig::default(),
            source: SourceConfig::default(),
            retry: RetryConfig::default(),
            service: ServiceConfig::default(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl CourierConfig {
    /// Create a config using the in-memory backend, for tests.
    pub fn for_testing(durable_name: &str) -> Self {
        Self {
            durable_name: durable_name.to_string(),
            backend: Backend::Memory,
            shutdown_grace: "10ms".to_string(),
            ..Default::default()
        }
    }

    /// Parse the shutdown grace period.
    pub fn shutdown_grace_duration(&self) -> Duration {
        parse_duration_or(&self.shutdown_grace, Duration::from_millis(100))
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.durable_name.trim().is_empty() {
            return Err(CourierError::Config("durable_name must not be empty".into()));
        }
        if self.pool.max_connections == 0 {
            return Err(CourierError::Config("pool.max_connections must be at least 1".into()));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(CourierError::Config(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        if self.source.read_count == 0 {
            return Err(CourierError::Config("source.read_count must be at least 1".into()));
        }
        if self.source.claim_count == 0 {
            return Err(CourierError::Config("source.claim_count must be at least 1".into()));
        }
        Ok(())
    }
}

/// Store implementation selected at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Redis (or any server speaking the Redis stream commands).
    #[default]
    Redis,
    /// In-process store. State is lost when the process exits.
    Memory,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PoolConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Connection pool bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections created eagerly on connect.
    #[serde(default)]
    pub min_connections: usize,

    /// Hard cap on live connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// How long `acquire()` waits before giving up (e.g. "10s").
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: String,

    /// Timeout for establishing one connection.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: String,
}

fn default_max_connections() -> usize {
    20
}

fn default_acquire_timeout() -> String {
    "10s".to_string()
}

fn default_connection_timeout() -> String {
    "5s".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 20,
            acquire_timeout: default_acquire_timeout(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.acquire_timeout, Duration::from_secs(10))
    }

    pub fn connection_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.connection_timeout, Duration::from_secs(5))
    }

    /// Small pool with short timeouts.
    pub fn for_testing() -> Self {
        Self {
            min_connections: 0,
            max_connections: 4,
            acquire_timeout: "500ms".to_string(),
            connection_timeout: "500ms".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Polling settings for stream message sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Maximum entries per group read.
    #[serde(default = "default_read_count")]
    pub read_count: usize,

    /// Block duration for group reads. Empty string disables blocking.
    #[serde(default = "default_block")]
    pub block: String,

    /// Minimum time an entry must sit unacknowledged before another
    /// consumer may claim it.
    #[serde(default = "default_claim_min_idle")]
    pub claim_min_idle: String,

    /// Maximum entries per claim.
    #[serde(default = "default_claim_count")]
    pub claim_count: usize,

    /// Maximum due scheduled entries promoted per poll.
    #[serde(default = "default_scheduled_per_poll")]
    pub scheduled_per_poll: usize,
}

fn default_read_count() -> usize {
    10
}

fn default_block() -> String {
    "1ms".to_string()
}

fn default_claim_min_idle() -> String {
    "5s".to_string()
}

fn default_claim_count() -> usize {
    10
}

fn default_scheduled_per_poll() -> usize {
    10
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            read_count: default_read_count(),
            block: default_block(),
            claim_min_idle: default_claim_min_idle(),
            claim_count: default_claim_count(),
            scheduled_per_poll: default_scheduled_per_poll(),
        }
    }
}

impl SourceConfig {
    /// Parsed block duration; `None` means non-blocking reads.
    pub fn block_duration(&self) -> Option<Duration> {
        if self.block.trim().is_empty() {
            return None;
        }
        Some(parse_duration_or(&self.block, Duration::from_millis(1)))
    }

    pub fn claim_min_idle_duration(&self) -> Duration {
        parse_duration_or(&self.claim_min_idle, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetryConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry defaults for events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Max retries for events registered without an explicit value.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Base of the exponential backoff. The delay before attempt `n + 1` is
    /// `backoff_base * 2^(n + 1)`.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> String {
    "1s".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
        }
    }
}

impl RetryConfig {
    pub fn backoff_base_duration(&self) -> Duration {
        parse_duration_or(&self.backoff_base, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ServiceConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Request/reply settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Upper bound on how long `request()` waits. `None` waits for as long
    /// as the engine is alive.
    #[serde(default)]
    pub request_timeout: Option<String>,

    /// Max retries stamped on service requests; a replier that keeps failing
    /// dead-letters the request after this many retries.
    #[serde(default = "default_reply_max_retries")]
    pub reply_max_retries: u32,
}

fn default_reply_max_retries() -> u32 {
    1
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            reply_max_retries: default_reply_max_retries(),
        }
    }
}

impl ServiceConfig {
    pub fn request_timeout_duration(&self) -> Option<Duration> {
        self.request_timeout
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
    }
}

fn parse_duration_or(s: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(s).unwrap_or(fallback)
}
