// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use proptest::prelude::*;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use stream_courier::message::{Message, ScheduledEntry};
use stream_courier::retry::{backoff_delay, Delivery, RetryEngine};
use stream_courier::store::{compare_stream_ids, parse_stream_id, StreamEntry, TopicKeys};
use stream_courier::{Disposition, ManualClock, MemoryStore, RetryOptions, StreamStore};

// =============================================================================
// Stream ID Properties
// =============================================================================

proptest! {
    /// Stream ID comparison is reflexive: a == a
    #[test]
    fn stream_id_comparison_reflexive(ts in 0u64..u64::MAX, seq in 0u64..1000u64) {
        let id = format!("{}-{}", ts, seq);
        prop_assert_eq!(compare_stream_ids(&id, &id), Ordering::Equal);
    }

    /// Stream ID comparison is antisymmetric: if a < b then b > a
    #[test]
    fn stream_id_comparison_antisymmetric(
        ts1 in 0u64..1_000_000_000_000u64,
        seq1 in 0u64..1000u64,
        ts2 in 0u64..1_000_000_000_000u64,
        seq2 in 0u64..1000u64,
    ) {
        let id1 = format!("{}-{}", ts1, seq1);
        let id2 = format!("{}-{}", ts2, seq2);
        prop_assert_eq!(compare_stream_ids(&id1, &id2).reverse(), compare_stream_ids(&id2, &id1));
    }

    /// Comparison agrees with numeric (timestamp, sequence) order, not string order.
    #[test]
    fn stream_id_comparison_is_numeric(
        ts1 in 0u64..1_000_000u64,
        seq1 in 0u64..100u64,
        ts2 in 0u64..1_000_000u64,
        seq2 in 0u64..100u64,
    ) {
        let id1 = format!("{}-{}", ts1, seq1);
        let id2 = format!("{}-{}", ts2, seq2);
        prop_assert_eq!(compare_stream_ids(&id1, &id2), (ts1, seq1).cmp(&(ts2, seq2)));
    }

    #[test]
    fn stream_id_parsing(ts in 0u64..u64::MAX, seq in 0u64..u64::MAX) {
        prop_assert_eq!(parse_stream_id(&format!("{}-{}", ts, seq)), Some((ts, seq)));
        prop_assert_eq!(parse_stream_id(&ts.to_string()), Some((ts, 0)));
    }

    /// Arbitrary text never panics the parsers.
    #[test]
    fn stream_id_garbage_no_panic(a in ".{0,40}", b in ".{0,40}") {
        let _ = parse_stream_id(&a);
        let _ = compare_stream_ids(&a, &b);
    }
}

// =============================================================================
// Backoff Properties
// =============================================================================

proptest! {
    /// Delay doubles with every recorded failure until it saturates.
    #[test]
    fn backoff_is_monotonic(base_ms in 1u64..10_000u64, retry_count in 0u32..64u32) {
        let base = Duration::from_millis(base_ms);
        prop_assert!(backoff_delay(base, retry_count + 1) >= backoff_delay(base, retry_count));
    }

    #[test]
    fn backoff_matches_formula(base_ms in 1u64..10_000u64, retry_count in 0u32..20u32) {
        let base = Duration::from_millis(base_ms);
        let expected = Duration::from_millis(base_ms * 2u64.pow(retry_count + 1));
        prop_assert_eq!(backoff_delay(base, retry_count), expected);
    }

    /// Huge retry counts saturate instead of overflowing.
    #[test]
    fn backoff_never_panics(base_ms in 0u64..u64::MAX / 2, retry_count in any::<u32>()) {
        let _ = backoff_delay(Duration::from_millis(base_ms), retry_count);
    }
}

// =============================================================================
// Field Codec Properties
// =============================================================================

proptest! {
    /// Decoding arbitrary entries never panics.
    #[test]
    fn message_from_arbitrary_fields_no_panic(
        fields in prop::collection::vec((".{0,12}", ".{0,24}"), 0..8),
        default_max in any::<u32>(),
    ) {
        let entry = StreamEntry::new("1-0", fields);
        if let Ok(message) = Message::from_entry(&entry, default_max) {
            prop_assert!(entry.field("data").is_some());
            prop_assert_eq!(message.data.as_str(), entry.field("data").unwrap_or_default());
        }
    }

    /// A missing or unparsable `maxRetries` falls back to the default.
    #[test]
    fn message_max_retries_fallback(raw in "[a-z]{0,6}", default_max in any::<u32>()) {
        let entry = StreamEntry::new(
            "1-0",
            vec![("data".to_string(), "{}".to_string()), ("maxRetries".to_string(), raw)],
        );
        let message = Message::from_entry(&entry, default_max).unwrap();
        prop_assert_eq!(message.max_retries, default_max);
        prop_assert_eq!(message.retry_count, 0);
    }

    #[test]
    fn scheduled_entry_decode_garbage_no_panic(raw in ".{0,200}") {
        let _ = ScheduledEntry::decode(&raw);
    }
}

// =============================================================================
// Retry Disposition Properties
// =============================================================================

fn strategy() -> impl Strategy<Value = RetryOptions> {
    prop_oneof![
        Just(RetryOptions::immediate()),
        Just(RetryOptions::exponential_backoff()),
        (0u64..1_000_000u64).prop_map(RetryOptions::at),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A message is dead-lettered exactly when it is out of retries and the
    /// retry is not forced; the live entry is acknowledged either way.
    #[test]
    fn dead_letter_iff_exhausted_and_not_forced(
        max_retries in 0u32..6u32,
        retry_count in 0u32..8u32,
        options in strategy(),
        force in any::<bool>(),
    ) {
        let options = if force { options.forced() } else { options };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let (disposition, dead, pending) = runtime.block_on(async {
            let clock = ManualClock::new(1_000);
            let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
            let engine = RetryEngine::new(store.clone(), Arc::new(clock), Duration::from_secs(1));
            let keys = TopicKeys::new("hermes:", "prop");

            let mut message = Message::new("{}", max_retries);
            message.retry_count = retry_count;
            store.create_group_if_absent(&keys.stream, "g").await.unwrap();
            store
                .append(&keys.stream, stream_courier::store::EntryId::Auto, message.to_fields())
                .await
                .unwrap();
            let entry = store.read_new(&keys.stream, "g", "c", 1, None).await.unwrap().remove(0);

            let delivery = Delivery {
                topic: "prop".to_string(),
                keys: keys.clone(),
                group: "g".to_string(),
                id: entry.id,
                message,
            };
            let disposition = engine
                .fail(&delivery, options, stream_courier::message::FailureInfo::new("Test", "boom"))
                .await
                .unwrap();
            (
                disposition,
                store.stream_len(&keys.dead_letter),
                store.pending_count(&keys.stream, "g"),
            )
        });

        let exhausted = retry_count >= max_retries;
        prop_assert_eq!(disposition == Disposition::DeadLettered, exhausted && !force);
        prop_assert_eq!(dead, usize::from(exhausted && !force));
        prop_assert_eq!(pending, 0);
    }
}
