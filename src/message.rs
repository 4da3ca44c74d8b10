// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persisted message records and their stream field codec.
//!
//! # Field Layout
//!
//! ```text
//! live stream     data=<json>  maxRetries=<n>  retryCount=<n>
//! response stream data=<json>  reqMsgId=<request id>
//! -failed / -dlq  record=<json FailedAttempt | DeadLetter>
//! -scheduled      member=<json ScheduledEntry>  score=dueTimestamp
//! ```
//!
//! Payloads are JSON text. `retryCount` defaults to 0 when absent; a
//! missing or unparsable `maxRetries` falls back to the caller's default.

use crate::error::{CourierError, Result};
use crate::store::StreamEntry;
use serde::{Deserialize, Serialize};

pub const FIELD_DATA: &str = "data";
pub const FIELD_MAX_RETRIES: &str = "maxRetries";
pub const FIELD_RETRY_COUNT: &str = "retryCount";
pub const FIELD_REQ_MSG_ID: &str = "reqMsgId";
pub const FIELD_RECORD: &str = "record";

/// A message as stored on a live stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// JSON-encoded payload.
    pub data: String,
    pub max_retries: u32,
    pub retry_count: u32,
}

impl Message {
    /// A fresh message with `retryCount = 0`.
    pub fn new(data: impl Into<String>, max_retries: u32) -> Self {
        Self {
            data: data.into(),
            max_retries,
            retry_count: 0,
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_DATA.to_string(), self.data.clone()),
            (FIELD_MAX_RETRIES.to_string(), self.max_retries.to_string()),
            (FIELD_RETRY_COUNT.to_string(), self.retry_count.to_string()),
        ]
    }

    /// Decode a live stream entry.
    pub fn from_entry(entry: &StreamEntry, default_max_retries: u32) -> Result<Self> {
        let data = entry.field(FIELD_DATA).ok_or_else(|| {
            CourierError::StreamParse(format!("entry {} has no {} field", entry.id, FIELD_DATA))
        })?;

        let max_retries = entry
            .field(FIELD_MAX_RETRIES)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_max_retries);

        let retry_count = match entry.field(FIELD_RETRY_COUNT) {
            None => 0,
            Some(v) => v.parse().map_err(|_| {
                CourierError::StreamParse(format!(
                    "entry {} has invalid {}: {:?}",
                    entry.id, FIELD_RETRY_COUNT, v
                ))
            })?,
        };

        Ok(Self {
            data: data.to_string(),
            max_retries,
            retry_count,
        })
    }

    /// The same message after one more recorded failure.
    pub fn retried(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Whether another retry is allowed.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Parse the payload as JSON.
    pub fn payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// A delay-queue member. `id` is the entry id of the failed delivery, which
/// keeps members unique even when two identical payloads are due together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEntry {
    pub topic: String,
    pub id: String,
    pub message: Message,
    pub due_timestamp: u64,
}

impl ScheduledEntry {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Description of why a delivery failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl FailureInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Describe a handler error, keeping its source chain as the "stack".
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            name: "HandlerError".to_string(),
            message: err.to_string(),
            stack: if chain.is_empty() {
                None
            } else {
                Some(chain.join("\ncaused by: "))
            },
        }
    }

    /// Describe a panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string());
        Self::new("Panic", message)
    }
}

/// One entry in the failed-attempts audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub message: Message,
    pub error: FailureInfo,
    pub timestamp: u64,
}

/// A message that ran out of retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    pub timestamp: u64,
}

/// Encode an audit or dead-letter record as stream fields.
pub fn record_fields<T: Serialize>(record: &T) -> Result<Vec<(String, String)>> {
    Ok(vec![(FIELD_RECORD.to_string(), serde_json::to_string(record)?)])
}

/// Decode a `record` stream entry.
pub fn decode_record<T: for<'de> Deserialize<'de>>(entry: &StreamEntry) -> Result<T> {
    let raw = entry.field(FIELD_RECORD).ok_or_else(|| {
        CourierError::StreamParse(format!("entry {} has no {} field", entry.id, FIELD_RECORD))
    })?;
    Ok(serde_json::from_str(raw)?)
}

/// A reply on a service's response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub data: String,
    /// Entry id of the request this answers.
    pub req_msg_id: Option<String>,
}

impl ResponseMessage {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![(FIELD_DATA.to_string(), self.data.clone())];
        if let Some(id) = &self.req_msg_id {
            fields.push((FIELD_REQ_MSG_ID.to_string(), id.clone()));
        }
        fields
    }

    pub fn from_entry(entry: &StreamEntry) -> Result<Self> {
        let data = entry.field(FIELD_DATA).ok_or_else(|| {
            CourierError::StreamParse(format!("response {} has no {} field", entry.id, FIELD_DATA))
        })?;
        Ok(Self {
            data: data.to_string(),
            req_msg_id: entry.field(FIELD_REQ_MSG_ID).map(str::to_string),
        })
    }
}
