//! # Event System
//!
//! In-process publish/subscribe. The scheduler announces schedule lifecycle changes here,
//! and applications publish their own topics alongside.
//!
//! Topics are dot-delimited. Subscriptions use [`TopicPattern`]s where `*` matches one
//! segment and `**` matches any number of segments, including none.
//!
//! ```rust
//! use orchestration_core::events::{DispatchMode, EventBus, EventBusConfig, SubscribeOptions};
//! use serde_json::json;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let bus = EventBus::new(EventBusConfig {
//!     dispatch_mode: DispatchMode::Awaited,
//!     ..Default::default()
//! });
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = seen.clone();
//! bus.subscribe(
//!     "system.**",
//!     move |_event| {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!         async { Ok(()) }
//!     },
//!     SubscribeOptions::default(),
//! )
//! .await
//! .unwrap();
//!
//! bus.emit("system.health.check", json!({})).await.unwrap();
//! bus.emit("system.metrics.cpu.high", json!({"cpu": 97})).await.unwrap();
//! assert_eq!(seen.load(Ordering::SeqCst), 2);
//! # });
//! ```

mod bus;
mod event;
mod history;
mod pattern;

pub use bus::{
    DispatchMode, EventBus, EventBusConfig, EventBusStats, HandlerResult, SubscribeOptions,
    Subscription,
};
pub use event::Event;
pub(crate) use history::EventHistory;
pub use pattern::{validate_topic, TopicPattern};
