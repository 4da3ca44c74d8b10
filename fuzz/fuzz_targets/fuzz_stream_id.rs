// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for stream ID parsing and comparison.
//!
//! Claims, pending bookkeeping and the in-memory store all order entries by
//! id, so neither parsing nor comparison may panic on arbitrary input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;
use stream_courier::store::{compare_stream_ids, parse_stream_id};

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    let ab = compare_stream_ids(a, b);
    let ba = compare_stream_ids(b, a);
    assert_eq!(ab, ba.reverse());
    assert_eq!(compare_stream_ids(a, a), Ordering::Equal);

    // Well-formed ids compare exactly like their parsed pairs.
    if let (Some(pa), Some(pb)) = (parse_stream_id(a), parse_stream_id(b)) {
        assert_eq!(ab, pa.cmp(&pb));
    }
});
