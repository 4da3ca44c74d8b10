// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for decoding stream entries and delay-queue members.
//!
//! Entries come from a shared store that other writers can touch; decoding
//! must fail cleanly rather than panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use stream_courier::message::{Message, ResponseMessage, ScheduledEntry};
use stream_courier::store::StreamEntry;

fuzz_target!(|data: (Vec<(String, String)>, &str, u32)| {
    let (fields, raw, default_max) = data;
    let entry = StreamEntry::new("1-0", fields);

    if let Ok(message) = Message::from_entry(&entry, default_max) {
        let again = Message::from_entry(&StreamEntry::new("1-0", message.to_fields()), default_max);
        assert_eq!(again.ok(), Some(message));
    }
    let _ = ResponseMessage::from_entry(&entry);
    let _ = ScheduledEntry::decode(raw);
});
