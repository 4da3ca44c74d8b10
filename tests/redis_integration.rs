// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests against a real Redis.
//!
//! Tests use testcontainers for portability - no external docker-compose required.
//!
//! # Running Tests
//! ```bash
//! # Run all Redis tests (requires Docker / OrbStack)
//! cargo test --test redis_integration -- --ignored
//!
//! # Run specific test
//! cargo test --test redis_integration redis_store -- --ignored
//! ```
//!
//! # Test Organization
//! - `redis_store_*` - the store adapter command by command
//! - `redis_courier_*` - end-to-end delivery through the facade

mod common;

use common::{eventually, raw_connection, redis_config, redis_container, redis_url};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream_courier::store::{EntryId, TopicKeys};
use stream_courier::{BoxError, Courier, Json, MessageHandle, RedisStore, StreamStore};
use testcontainers::clients::Cli;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Hello {
    name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Greeting {
    message: String,
}

fn fields(data: &str) -> Vec<(String, String)> {
    vec![("data".to_string(), data.to_string())]
}

// =============================================================================
// Store Adapter
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_store_group_read_ack() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);
    let store = RedisStore::connect(&redis_config(&url, "g")).await.unwrap();

    store.create_group_if_absent("t:s", "g").await.unwrap();
    // Second create is a no-op (BUSYGROUP swallowed).
    store.create_group_if_absent("t:s", "g").await.unwrap();

    let first = store.append("t:s", EntryId::Auto, fields("1")).await.unwrap();
    store.append("t:s", EntryId::Auto, fields("2")).await.unwrap();

    let batch = store.read_new("t:s", "g", "c1", 10, None).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].id, first);
    assert_eq!(batch[0].field("data"), Some("1"));

    let empty = store
        .read_new("t:s", "g", "c1", 10, Some(Duration::from_millis(10)))
        .await
        .unwrap();
    assert!(empty.is_empty());

    let ids: Vec<String> = batch.iter().map(|e| e.id.clone()).collect();
    assert_eq!(store.ack("t:s", "g", &ids).await.unwrap(), 2);
    assert_eq!(store.ack("t:s", "g", &ids).await.unwrap(), 0);

    store.close().await.unwrap();
    assert!(store.pool().is_closed());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_store_missing_group_self_heals() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);
    let store = RedisStore::connect(&redis_config(&url, "g")).await.unwrap();

    // No stream, no group: both reads return empty and create the group.
    assert!(store.read_new("t:s", "g", "c1", 10, None).await.unwrap().is_empty());
    assert!(store
        .claim_stale("t:s", "g", "c1", Duration::ZERO, 10)
        .await
        .unwrap()
        .is_empty());

    store.append("t:s", EntryId::Auto, fields("1")).await.unwrap();
    let batch = store.read_new("t:s", "g", "c1", 10, None).await.unwrap();
    assert_eq!(batch.len(), 1);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_store_claim_and_deregister() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);
    let store = RedisStore::connect(&redis_config(&url, "g")).await.unwrap();

    store.create_group_if_absent("t:s", "g").await.unwrap();
    let id = store.append("t:s", EntryId::Auto, fields("1")).await.unwrap();
    store.read_new("t:s", "g", "crashed", 10, None).await.unwrap();

    let none = store
        .claim_stale("t:s", "g", "c2", Duration::from_secs(60), 10)
        .await
        .unwrap();
    assert!(none.is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let claimed = store
        .claim_stale("t:s", "g", "c2", Duration::from_millis(10), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, id);

    assert!(store.deregister_consumer("t:s", "g", "crashed").await.unwrap());
    assert!(!store.deregister_consumer("t:s", "nope", "c2").await.unwrap());
    // Not a stream.
    store.schedule_add("t:q", 1, "x").await.unwrap();
    assert!(!store.deregister_consumer("t:q", "g", "c2").await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_store_read_pending_per_consumer() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);
    let store = RedisStore::connect(&redis_config(&url, "g")).await.unwrap();

    store.create_group_if_absent("t:s", "g").await.unwrap();
    for data in ["1", "2", "3"] {
        store.append("t:s", EntryId::Auto, fields(data)).await.unwrap();
    }
    store.read_new("t:s", "g", "c1", 2, None).await.unwrap();
    store.read_new("t:s", "g", "c2", 10, None).await.unwrap();

    let mine = store.read_pending("t:s", "g", "c1", 10).await.unwrap();
    assert_eq!(mine.len(), 2);
    assert_eq!(mine[0].field("data"), Some("1"));
    assert_eq!(mine[1].field("data"), Some("2"));

    let ids = vec![mine[0].id.clone()];
    store.ack("t:s", "g", &ids).await.unwrap();
    assert_eq!(store.read_pending("t:s", "g", "c1", 10).await.unwrap().len(), 1);

    assert!(store.read_pending("t:s", "nope", "c1", 10).await.unwrap().is_empty());
    store.schedule_add("t:q", 1, "x").await.unwrap();
    assert!(store.read_pending("t:q", "g", "c1", 10).await.unwrap().is_empty());
}

/// Test: a message left unsettled by a disconnecting courier is handed to
/// the next member of the group.
#[tokio::test]
#[ignore] // Requires Docker
async fn redis_courier_disconnect_hands_back_unsettled() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);

    let first = Courier::new(redis_config(&url, "orders-svc")).unwrap();
    first.connect().await.unwrap();
    let event = first.register_event("orders", Json::<Order>::new());
    let seen = Arc::new(AtomicU32::new(0));
    let sub = event.clone();
    let counter = seen.clone();
    let task = tokio::spawn(async move {
        sub.subscribe(move |_order: Order, _msg: MessageHandle| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        })
        .await
    });
    event.publish(&Order { id: 3 }).await.unwrap();
    assert!(eventually(|| seen.load(Ordering::SeqCst) == 1).await);
    first.disconnect().await.unwrap();
    task.await.unwrap().unwrap();

    let second = Courier::new(redis_config(&url, "orders-svc")).unwrap();
    second.connect().await.unwrap();
    let event = second.register_event("orders", Json::<Order>::new());
    let got = Arc::new(AtomicU32::new(0));
    let sub = event.clone();
    let counter = got.clone();
    let task = tokio::spawn(async move {
        sub.subscribe(move |order: Order, msg: MessageHandle| {
            let counter = counter.clone();
            async move {
                msg.ack().await?;
                counter.store(order.id, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        })
        .await
    });

    assert!(eventually(|| got.load(Ordering::SeqCst) == 3).await);
    second.disconnect().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_store_delay_queue_and_scan() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);
    let store = RedisStore::connect(&redis_config(&url, "g")).await.unwrap();

    store.schedule_add("ns:t-scheduled", 200, "late").await.unwrap();
    store.schedule_add("ns:t-scheduled", 100, "early").await.unwrap();

    assert_eq!(store.schedule_pop_due("ns:t-scheduled", 50).await.unwrap(), None);
    assert_eq!(
        store.schedule_pop_due("ns:t-scheduled", 150).await.unwrap(),
        Some("early".to_string())
    );
    assert_eq!(
        store.schedule_pop_due("ns:t-scheduled", 500).await.unwrap(),
        Some("late".to_string())
    );
    assert_eq!(store.schedule_pop_due("ns:t-scheduled", 500).await.unwrap(), None);

    store.append("ns:a", EntryId::Auto, fields("1")).await.unwrap();
    store.append("ns:b", EntryId::Auto, fields("1")).await.unwrap();
    store.append("other:c", EntryId::Auto, fields("1")).await.unwrap();
    let mut keys = store.list_keys("ns:").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["ns:a".to_string(), "ns:b".to_string()]);
}

// =============================================================================
// Courier End-to-End
// =============================================================================

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_courier_publish_subscribe() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);
    let courier = Courier::new(redis_config(&url, "orders-svc")).unwrap();
    courier.connect().await.unwrap();

    let event = courier.register_event("orders", Json::<Order>::new());
    let calls = Arc::new(AtomicU32::new(0));
    let sub = event.clone();
    let counter = calls.clone();
    let task = tokio::spawn(async move {
        sub.subscribe(move |_order: Order, msg: MessageHandle| {
            let counter = counter.clone();
            async move {
                msg.ack().await?;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        })
        .await
    });

    for id in 0..5 {
        event.publish(&Order { id }).await.unwrap();
    }
    assert!(eventually(|| calls.load(Ordering::SeqCst) == 5).await);

    let mut conn = raw_connection(&url).await;
    let pending: redis::Value = redis::cmd("XPENDING")
        .arg(&event.keys().stream)
        .arg(courier.group())
        .query_async(&mut conn)
        .await
        .unwrap();
    match pending {
        redis::Value::Array(items) => assert_eq!(items[0], redis::Value::Int(0)),
        other => panic!("unexpected XPENDING reply: {:?}", other),
    }

    courier.disconnect().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_courier_retries_then_dead_letters() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);
    let mut config = redis_config(&url, "orders-svc");
    config.retry.backoff_base = "10ms".to_string();
    let courier = Courier::new(config).unwrap();
    courier.connect().await.unwrap();

    let event = courier
        .register_event("orders", Json::<Order>::new())
        .with_max_retries(2);
    let keys = event.keys().clone();
    let calls = Arc::new(AtomicU32::new(0));
    let sub = event.clone();
    let counter = calls.clone();
    let task = tokio::spawn(async move {
        sub.subscribe(move |_order: Order, _msg: MessageHandle| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), BoxError>("broken".into())
            }
        })
        .await
    });

    event.publish(&Order { id: 1 }).await.unwrap();

    let mut conn = raw_connection(&url).await;
    let mut dead = 0usize;
    for _ in 0..200 {
        dead = redis::cmd("XLEN")
            .arg(&keys.dead_letter)
            .query_async(&mut conn)
            .await
            .unwrap();
        if dead == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(dead, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let scheduled: usize = redis::cmd("ZCARD")
        .arg(&keys.scheduled)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(scheduled, 0);

    courier.disconnect().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_courier_say_hello() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);
    let courier = Courier::new(redis_config(&url, "greeter")).unwrap();
    courier.connect().await.unwrap();

    let service = courier.register_service("say-hello", Json::<Hello>::new(), Json::<Greeting>::new());
    let replier = service.clone();
    let task = tokio::spawn(async move {
        replier
            .reply(|req: Hello, _ctx| async move {
                Ok::<_, BoxError>(Greeting {
                    message: format!("Hello, {}!", req.name),
                })
            })
            .await
    });

    let response = service.request(&Hello { name: "Joe".into() }).await.unwrap();
    assert_eq!(response.message, "Hello, Joe!");

    courier.disconnect().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_courier_disconnect_deregisters_consumer() {
    let docker = Cli::default();
    let container = redis_container(&docker);
    let url = redis_url(&container);
    let courier = Courier::new(redis_config(&url, "orders-svc")).unwrap();
    courier.connect().await.unwrap();

    let event = courier.register_event("orders", Json::<Order>::new());
    let sub = event.clone();
    let task = tokio::spawn(async move {
        sub.subscribe(|_order: Order, msg: MessageHandle| async move {
            msg.ack().await?;
            Ok::<_, BoxError>(())
        })
        .await
    });
    event.publish(&Order { id: 1 }).await.unwrap();

    let keys = TopicKeys::new(&courier.config().namespace, "orders");
    let mut conn = raw_connection(&url).await;
    let mut consumers: Vec<redis::Value> = Vec::new();
    for _ in 0..100 {
        consumers = redis::cmd("XINFO")
            .arg("CONSUMERS")
            .arg(&keys.stream)
            .arg(courier.group())
            .query_async(&mut conn)
            .await
            .unwrap();
        if !consumers.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(consumers.len(), 1);

    courier.disconnect().await.unwrap();
    task.await.unwrap().unwrap();

    let consumers: Vec<redis::Value> = redis::cmd("XINFO")
        .arg("CONSUMERS")
        .arg(&keys.stream)
        .arg(courier.group())
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(consumers.is_empty());
}
