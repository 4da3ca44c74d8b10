// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed stream store.
//!
//! Every operation checks out one pooled connection, runs one command (or
//! script) and returns the connection immediately.
//!
//! # Command Mapping
//!
//! | Operation | Command |
//! |-----------|---------|
//! | append | `XADD key id field value ...` |
//! | create_group_if_absent | `XGROUP CREATE key group 0 MKSTREAM` (BUSYGROUP ignored) |
//! | read_new | `XREADGROUP GROUP g c COUNT n [BLOCK ms] STREAMS key >` |
//! | claim_stale | `XAUTOCLAIM key g c min_idle 0-0 COUNT n` |
//! | ack | `XACK key g id ...` |
//! | read_pending | `TYPE` + `XINFO GROUPS` + `XREADGROUP GROUP g c COUNT n STREAMS key 0` |
//! | deregister_consumer | `TYPE` + `XINFO GROUPS` + `XGROUP DELCONSUMER` |
//! | schedule_add | `ZADD queue due payload` |
//! | schedule_pop_due | Lua: `ZRANGEBYSCORE ... LIMIT 0 1` + `ZREM` |
//! | list_keys | `SCAN 0 MATCH prefix* COUNT 100` until the cursor wraps |
//!
//! `NOGROUP` on read or claim creates the group and returns no entries.
//! Errors that mean the link is gone mark the connection broken, so the
//! pool drops it instead of reusing it.

use super::{BoxFuture, EntryId, StreamEntry, StreamStore};
use crate::config::CourierConfig;
use crate::error::{CourierError, PoolError, Result};
use crate::metrics;
use crate::pool::{ConnectionFactory, ConnectionPool, CreateFuture, PoolOptions};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamInfoGroupsReply, StreamReadReply};
use redis::{FromRedisValue, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

const POP_DUE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #due == 0 then
    return false
end
redis.call('ZREM', KEYS[1], due[1])
return due[1]
";

const SCAN_COUNT: usize = 100;

/// Opens multiplexed connections for the pool.
pub struct RedisConnector {
    client: redis::Client,
    connect_timeout: Duration,
}

impl RedisConnector {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| CourierError::Config(format!("invalid redis url: {}", e)))?;
        Ok(Self {
            client,
            connect_timeout,
        })
    }
}

/// A pooled Redis connection.
pub struct RedisConnection {
    conn: MultiplexedConnection,
    broken: bool,
}

impl RedisConnection {
    /// Pass a command result through, remembering if the link died.
    fn observe<T>(&mut self, result: redis::RedisResult<T>) -> redis::RedisResult<T> {
        if let Err(e) = &result {
            if e.is_io_error() || e.is_connection_dropped() || e.is_unrecoverable_error() {
                self.broken = true;
            }
        }
        result
    }
}

impl ConnectionFactory for RedisConnector {
    type Connection = RedisConnection;

    fn create(&self) -> CreateFuture<'_, RedisConnection> {
        Box::pin(async move {
            let conn = tokio::time::timeout(
                self.connect_timeout,
                self.client.get_multiplexed_async_connection(),
            )
            .await
            .map_err(|_| PoolError::Create("connection timed out".to_string()))?
            .map_err(|e| PoolError::Create(e.to_string()))?;

            Ok(RedisConnection {
                conn,
                broken: false,
            })
        })
    }

    fn is_valid(&self, conn: &RedisConnection) -> bool {
        !conn.broken
    }
}

/// [`StreamStore`] over a Redis server.
pub struct RedisStore {
    pool: ConnectionPool<RedisConnector>,
    pop_due: redis::Script,
}

impl RedisStore {
    /// Build the pool from config and pre-warm it.
    pub async fn connect(config: &CourierConfig) -> Result<Self> {
        let connector =
            RedisConnector::new(&config.redis_url, config.pool.connection_timeout_duration())?;
        let store = Self::with_pool(ConnectionPool::new(
            connector,
            PoolOptions::from(&config.pool),
        ));
        store.pool.start().await?;
        debug!(url = %config.redis_url, "Redis store ready");
        Ok(store)
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: ConnectionPool<RedisConnector>) -> Self {
        Self {
            pool,
            pop_due: redis::Script::new(POP_DUE_SCRIPT),
        }
    }

    /// The underlying pool (status, events).
    pub fn pool(&self) -> &ConnectionPool<RedisConnector> {
        &self.pool
    }

    /// Run a command, returning the raw Redis result so callers can inspect
    /// error codes. Only pool failures become `CourierError` here.
    async fn raw<T: FromRedisValue>(
        &self,
        op: &'static str,
        cmd: &redis::Cmd,
    ) -> Result<redis::RedisResult<T>> {
        let mut conn = self.pool.acquire().await?;
        let started = Instant::now();
        let result = cmd.query_async(&mut conn.conn).await;
        metrics::record_store_latency(op, started.elapsed());
        Ok(conn.observe(result))
    }

    async fn run<T: FromRedisValue>(&self, op: &'static str, cmd: &redis::Cmd) -> Result<T> {
        self.raw(op, cmd).await?.map_err(|e| command_failed(op, e))
    }

    async fn create_group(&self, key: &str, group: &str) -> Result<()> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(key).arg(group).arg("0").arg("MKSTREAM");

        match self.raw::<Value>("XGROUP CREATE", &cmd).await? {
            Ok(_) => {
                debug!(key = %key, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if is_busy_group(&e) => Ok(()),
            Err(e) => Err(command_failed("XGROUP CREATE", e)),
        }
    }

    /// Whether `key` is a stream carrying `group`.
    async fn has_group(&self, key: &str, group: &str) -> Result<bool> {
        let mut type_cmd = redis::cmd("TYPE");
        type_cmd.arg(key);
        let key_type: String = self.run("TYPE", &type_cmd).await?;
        if key_type != "stream" {
            return Ok(false);
        }

        let mut info_cmd = redis::cmd("XINFO");
        info_cmd.arg("GROUPS").arg(key);
        let info: StreamInfoGroupsReply = self.run("XINFO GROUPS", &info_cmd).await?;
        Ok(info.groups.iter().any(|g| g.name == group))
    }

    async fn heal_missing_group(&self, op: &str, key: &str, group: &str) -> Result<Vec<StreamEntry>> {
        warn!(key = %key, group = %group, operation = op, "Consumer group missing, creating it");
        self.create_group(key, group).await?;
        Ok(Vec::new())
    }
}

fn command_failed(op: &'static str, e: redis::RedisError) -> CourierError {
    metrics::record_store_error(op);
    error!(operation = op, error = %e, "Redis command failed");
    CourierError::redis(op, e)
}

fn is_busy_group(e: &redis::RedisError) -> bool {
    e.code() == Some("BUSYGROUP") || e.to_string().contains("BUSYGROUP")
}

fn is_no_group(e: &redis::RedisError) -> bool {
    e.code() == Some("NOGROUP") || e.to_string().contains("NOGROUP")
}

/// Escape glob metacharacters for `SCAN MATCH`.
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Render a scalar reply value as text.
fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Okay => Some("OK".to_string()),
        Value::VerbatimString { text, .. } => Some(text.clone()),
        _ => None,
    }
}

/// Fields from a parsed stream id map, sorted by name.
fn map_fields(map: &HashMap<String, Value>) -> Result<Vec<(String, String)>> {
    let mut fields = map
        .iter()
        .map(|(name, value)| {
            value_to_string(value)
                .map(|v| (name.clone(), v))
                .ok_or_else(|| {
                    CourierError::StreamParse(format!(
                        "Unexpected type for field {}: {:?}",
                        name, value
                    ))
                })
        })
        .collect::<Result<Vec<_>>>()?;
    fields.sort();
    Ok(fields)
}

/// Parse a flat `[field, value, field, value, ...]` reply.
fn flat_fields(value: &Value) -> Result<Vec<(String, String)>> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Array(items) => {
            if items.len() % 2 != 0 {
                return Err(CourierError::StreamParse(
                    "odd number of field/value items".to_string(),
                ));
            }
            items
                .chunks(2)
                .map(|pair| {
                    let name = value_to_string(&pair[0]);
                    let val = value_to_string(&pair[1]);
                    match (name, val) {
                        (Some(n), Some(v)) => Ok((n, v)),
                        _ => Err(CourierError::StreamParse(format!(
                            "non-text field pair: {:?}",
                            pair
                        ))),
                    }
                })
                .collect()
        }
        Value::Map(pairs) => pairs
            .iter()
            .map(|(k, v)| match (value_to_string(k), value_to_string(v)) {
                (Some(n), Some(v)) => Ok((n, v)),
                _ => Err(CourierError::StreamParse(format!(
                    "non-text field pair: {:?} {:?}",
                    k, v
                ))),
            })
            .collect(),
        other => Err(CourierError::StreamParse(format!(
            "unexpected fields reply: {:?}",
            other
        ))),
    }
}

/// Parse an `XAUTOCLAIM` reply: `[next_cursor, [[id, [f, v, ...]], ...], deleted?]`.
///
/// Entries deleted from the stream come back as nil (Redis 6.2) or with nil
/// fields; both are skipped.
fn parse_autoclaim(value: &Value) -> Result<Vec<StreamEntry>> {
    let parts = match value {
        Value::Array(parts) => parts,
        Value::Nil => return Ok(Vec::new()),
        other => {
            return Err(CourierError::StreamParse(format!(
                "unexpected XAUTOCLAIM reply: {:?}",
                other
            )))
        }
    };

    let Some(Value::Array(items)) = parts.get(1) else {
        return Err(CourierError::StreamParse(
            "XAUTOCLAIM reply has no entry list".to_string(),
        ));
    };

    entry_list(items, false)
}

/// Parse `[[id, [f, v, ...]], ...]`. Deleted entries (nil fields) are either
/// skipped or kept with no fields.
fn entry_list(items: &[Value], keep_deleted: bool) -> Result<Vec<StreamEntry>> {
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let Value::Array(pair) = item else {
            continue;
        };
        let (Some(id), Some(fields)) = (pair.first().and_then(value_to_string), pair.get(1)) else {
            continue;
        };
        if matches!(fields, Value::Nil) {
            if keep_deleted {
                entries.push(StreamEntry::new(id, Vec::new()));
            }
            continue;
        }
        entries.push(StreamEntry::new(id, flat_fields(fields)?));
    }
    Ok(entries)
}

/// Parse an `XREADGROUP ... STREAMS key 0` reply for one key.
///
/// RESP2 answers `[[key, entries]]`, RESP3 `{key: entries}`.
fn parse_own_pending(value: &Value) -> Result<Vec<StreamEntry>> {
    let items = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(streams) if streams.is_empty() => return Ok(Vec::new()),
        Value::Array(streams) => match streams.first() {
            Some(Value::Array(stream)) => stream.get(1),
            _ => None,
        },
        Value::Map(streams) => streams.first().map(|(_, entries)| entries),
        _ => None,
    };
    match items {
        Some(Value::Array(items)) => entry_list(items, true),
        _ => Err(CourierError::StreamParse(format!(
            "unexpected XREADGROUP reply: {:?}",
            value
        ))),
    }
}

impl StreamStore for RedisStore {
    fn append<'a>(
        &'a self,
        key: &'a str,
        id: EntryId,
        fields: Vec<(String, String)>,
    ) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let mut cmd = redis::cmd("XADD");
            cmd.arg(key).arg(id.as_arg());
            for (name, value) in &fields {
                cmd.arg(name).arg(value);
            }
            let id: String = self.run("XADD", &cmd).await?;
            trace!(key = %key, id = %id, "XADD");
            Ok(id)
        })
    }

    fn create_group_if_absent<'a>(&'a self, key: &'a str, group: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.create_group(key, group))
    }

    fn read_new<'a>(
        &'a self,
        key: &'a str,
        group: &'a str,
        consumer: &'a str,
        count: usize,
        block: Option<Duration>,
    ) -> BoxFuture<'a, Vec<StreamEntry>> {
        Box::pin(async move {
            let mut cmd = redis::cmd("XREADGROUP");
            cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
            // BLOCK 0 waits forever; a zero duration means "don't block".
            if let Some(block) = block.filter(|d| !d.is_zero()) {
                cmd.arg("BLOCK").arg(block.as_millis() as u64);
            }
            cmd.arg("STREAMS").arg(key).arg(">");

            let reply = match self.raw::<Option<StreamReadReply>>("XREADGROUP", &cmd).await? {
                Ok(reply) => reply,
                Err(e) if is_no_group(&e) => {
                    return self.heal_missing_group("XREADGROUP", key, group).await
                }
                Err(e) => return Err(command_failed("XREADGROUP", e)),
            };

            let mut entries = Vec::new();
            for stream in reply.map(|r| r.keys).unwrap_or_default() {
                for id in stream.ids {
                    entries.push(StreamEntry::new(id.id.clone(), map_fields(&id.map)?));
                }
            }
            trace!(key = %key, count = entries.len(), "XREADGROUP");
            Ok(entries)
        })
    }

    fn claim_stale<'a>(
        &'a self,
        key: &'a str,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        count: usize,
    ) -> BoxFuture<'a, Vec<StreamEntry>> {
        Box::pin(async move {
            let mut cmd = redis::cmd("XAUTOCLAIM");
            cmd.arg(key)
                .arg(group)
                .arg(consumer)
                .arg(min_idle.as_millis() as u64)
                .arg("0-0")
                .arg("COUNT")
                .arg(count);

            let reply = match self.raw::<Value>("XAUTOCLAIM", &cmd).await? {
                Ok(reply) => reply,
                Err(e) if is_no_group(&e) => {
                    return self.heal_missing_group("XAUTOCLAIM", key, group).await
                }
                Err(e) => return Err(command_failed("XAUTOCLAIM", e)),
            };

            let entries = parse_autoclaim(&reply)?;
            trace!(key = %key, count = entries.len(), "XAUTOCLAIM");
            Ok(entries)
        })
    }

    fn ack<'a>(&'a self, key: &'a str, group: &'a str, ids: &'a [String]) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(0);
            }
            let mut cmd = redis::cmd("XACK");
            cmd.arg(key).arg(group).arg(ids);
            self.run("XACK", &cmd).await
        })
    }

    fn read_pending<'a>(
        &'a self,
        key: &'a str,
        group: &'a str,
        consumer: &'a str,
        count: usize,
    ) -> BoxFuture<'a, Vec<StreamEntry>> {
        Box::pin(async move {
            if !self.has_group(key, group).await? {
                return Ok(Vec::new());
            }

            // Id 0 replays this consumer's own pending list instead of new entries.
            let mut cmd = redis::cmd("XREADGROUP");
            cmd.arg("GROUP")
                .arg(group)
                .arg(consumer)
                .arg("COUNT")
                .arg(count)
                .arg("STREAMS")
                .arg(key)
                .arg("0");
            let reply = match self.raw::<Value>("XREADGROUP", &cmd).await? {
                Ok(reply) => reply,
                Err(e) if is_no_group(&e) => return Ok(Vec::new()),
                Err(e) => return Err(command_failed("XREADGROUP", e)),
            };

            let entries = parse_own_pending(&reply)?;
            trace!(key = %key, consumer = %consumer, count = entries.len(), "Read own pending");
            Ok(entries)
        })
    }

    fn deregister_consumer<'a>(
        &'a self,
        key: &'a str,
        group: &'a str,
        consumer: &'a str,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            if !self.has_group(key, group).await? {
                return Ok(false);
            }

            let mut cmd = redis::cmd("XGROUP");
            cmd.arg("DELCONSUMER").arg(key).arg(group).arg(consumer);
            let dropped_pending: i64 = self.run("XGROUP DELCONSUMER", &cmd).await?;
            debug!(
                key = %key,
                group = %group,
                consumer = %consumer,
                dropped_pending,
                "Deregistered consumer"
            );
            Ok(true)
        })
    }

    fn schedule_add<'a>(
        &'a self,
        queue_key: &'a str,
        due_millis: u64,
        payload: &'a str,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut cmd = redis::cmd("ZADD");
            cmd.arg(queue_key).arg(due_millis).arg(payload);
            let _: i64 = self.run("ZADD", &cmd).await?;
            Ok(())
        })
    }

    fn schedule_pop_due<'a>(
        &'a self,
        queue_key: &'a str,
        now_millis: u64,
    ) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await?;
            let started = Instant::now();
            let result = self
                .pop_due
                .key(queue_key)
                .arg(now_millis)
                .invoke_async(&mut conn.conn)
                .await;
            metrics::record_store_latency("POPDUE", started.elapsed());
            conn.observe(result).map_err(|e| command_failed("POPDUE", e))
        })
    }

    fn list_keys<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let pattern = format!("{}*", escape_glob(prefix));
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let mut cmd = redis::cmd("SCAN");
                cmd.arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT);
                let (next, batch): (u64, Vec<String>) = self.run("SCAN", &cmd).await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.pool.end().await;
            Ok(())
        })
    }
}
