// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Stream Courier
//!
//! Durable, at-least-once message delivery on top of Redis streams and
//! consumer groups.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               Courier                                     │
//! │                                                                           │
//! │  ┌──────────────┐   ┌──────────────┐   ┌────────────────────────────────┐ │
//! │  │ Event<T>     │──►│ MessageSource│──►│ handler(payload, MessageHandle)│ │
//! │  │ Service<Q,R> │   │ read ⇄ claim │   │ ack / retry / fail             │ │
//! │  └──────────────┘   └──────────────┘   └────────────────────────────────┘ │
//! │         │                  │                          │                   │
//! │         ▼                  ▼                          ▼                   │
//! │  ┌─────────────────────────────────┐     ┌──────────────────────────┐     │
//! │  │ StreamStore (Redis | memory)    │◄────│ RetryEngine              │     │
//! │  │ over a ConnectionPool           │     │ requeue / delay / DLQ    │     │
//! │  └─────────────────────────────────┘     └──────────────────────────┘     │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! 1. **Publish**: the payload is validated and appended to the topic stream.
//! 2. **Consume**: subscribers share a durable consumer group and alternate
//!    between reading new entries and claiming entries another consumer left
//!    pending for too long. Due delayed retries are promoted back onto the
//!    stream on the way.
//! 3. **Settle**: a handler acknowledges, or asks for a retry (immediately,
//!    at a time, or with exponential backoff). A failing handler gets the
//!    backoff. Messages out of retries land in the dead-letter stream.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use stream_courier::{Courier, CourierConfig, Json};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Hello { name: String }
//!
//! #[derive(Serialize, Deserialize)]
//! struct Greeting { message: String }
//!
//! #[tokio::main]
//! async fn main() -> stream_courier::Result<()> {
//!     let courier = Courier::new(CourierConfig {
//!         durable_name: "greeter".into(),
//!         ..Default::default()
//!     })?;
//!     courier.connect().await?;
//!
//!     let service = courier.register_service("say-hello", Json::<Hello>::new(), Json::<Greeting>::new());
//!
//!     let replier = service.clone();
//!     tokio::spawn(async move {
//!         replier
//!             .reply(|req: Hello, _ctx| async move {
//!                 Ok::<_, stream_courier::BoxError>(Greeting { message: format!("Hello, {}!", req.name) })
//!             })
//!             .await
//!     });
//!
//!     let greeting = service.request(&Hello { name: "Joe".into() }).await?;
//!     assert_eq!(greeting.message, "Hello, Joe!");
//!
//!     courier.disconnect().await
//! }
//! ```

pub mod bus;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod schema;
pub mod service;
pub mod source;
pub mod store;

pub use bus::{Event, MessageHandle, PublishOptions};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CourierConfig;
pub use engine::{Courier, EngineState};
pub use error::{BoxError, CourierError, Result};
pub use retry::{Disposition, RetryOptions, RetryStrategy};
pub use schema::{Json, Schema, SchemaExt};
pub use service::{ReplyContext, Service};
pub use store::{MemoryStore, RedisStore, StreamStore};
