// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the courier.
//!
//! Errors are categorized by where they originate (the backing store, the
//! connection pool, payload validation, user handlers) and carry enough
//! context to tell which topic and which stage failed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Redis` | Yes | Network errors, timeouts, failed store commands |
//! | `Pool` | Timeout only | Pool exhausted, closed, or connection creation failed |
//! | `Validation` | No | Payload rejected by a schema |
//! | `Handler` | No | A user handler failed |
//! | `Request` | No | No response observed, or a malformed response |
//! | `StreamParse` | No | Stream entry is missing fields or malformed |
//! | `AlreadySettled` | No | `ack`/`retry` called twice for one delivery |
//! | `Config` | No | Configuration invalid |
//! | `NotConnected` | No | Operation attempted before `connect()` |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Handler Errors
//!
//! Errors returned by subscription handlers never leave the subscription
//! loop; they are routed through the retry engine. [`BoxError`] is the type
//! handlers return.

use thiserror::Error;

/// Result type alias for courier operations.
pub type Result<T> = std::result::Result<T, CourierError>;

/// Error type returned by user-supplied handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The step at which a payload failed schema validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    /// Before writing an event.
    Publish,
    /// Decoding an event pulled from the stream.
    Subscribe,
    /// Before writing a service request.
    Request,
    /// Decoding a request inside a replier, or checking the reply it produced.
    Reply,
    /// Decoding the response a requester received.
    Response,
}

impl std::fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
            Self::Request => "request",
            Self::Reply => "reply",
            Self::Response => "response",
        };
        f.write_str(s)
    }
}

/// Errors raised by the connection pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool has been ended; no further checkouts are possible.
    #[error("connection pool is closed")]
    Closed,

    /// No connection became available within the acquire timeout.
    #[error("timed out waiting for a pooled connection")]
    Timeout,

    /// Creating a new connection failed.
    #[error("failed to create connection: {0}")]
    Create(String),
}

/// Errors that can occur while publishing, consuming or serving.
#[derive(Error, Debug)]
pub enum CourierError {
    /// Redis connection or command error.
    ///
    /// Logged and returned to the caller of the failing operation.
    /// Not retried internally, except a missing consumer group, which is
    /// created on the spot.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Connection pool failure.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Payload rejected by a schema.
    ///
    /// Fails the originating call; no partial write happens.
    #[error("Validation error on {topic} ({stage}): {message}")]
    Validation {
        topic: String,
        stage: ValidationStage,
        message: String,
    },

    /// A request did not get a usable response.
    #[error("Request error on {topic}: {message}")]
    Request { topic: String, message: String },

    /// Stream entry has an unexpected shape.
    #[error("Stream parse error: {0}")]
    StreamParse(String),

    /// `ack()` or `retry()` was called on a delivery that is already settled.
    #[error("Message {msg_id} is already settled")]
    AlreadySettled { msg_id: String },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine has not been connected yet, or was disconnected.
    #[error("Not connected")]
    NotConnected,
}

impl CourierError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a validation error.
    pub fn validation(
        topic: impl Into<String>,
        stage: ValidationStage,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            topic: topic.into(),
            stage,
            message: message.into(),
        }
    }

    /// Create a request error.
    pub fn request(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Request {
            topic: topic.into(),
            message: message.into(),
        }
    }
}

impl From<redis::RedisError> for CourierError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(e: serde_json::Error) -> Self {
        Self::StreamParse(format!("JSON: {}", e))
    }
}
