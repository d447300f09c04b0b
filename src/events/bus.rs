//! # Event Bus
//!
//! Publish/subscribe with hierarchical wildcard topics, bounded history and replay.
//!
//! ## Dispatch contract
//!
//! Matching handlers are always invoked in subscription order. What `emit` waits for
//! depends on [`DispatchMode`]:
//!
//! - `Detached` (default): every handler is invoked and its future spawned onto the
//!   runtime; `emit` returns once all handlers have been started, not completed.
//! - `Awaited`: handlers run one after another and `emit` returns after the last one
//!   finished.
//!
//! In both modes a handler that fails or panics is logged and counted; it never reaches
//! the emitter and never prevents other handlers from running.

use super::pattern::{validate_topic, TopicPattern};
use super::{Event, EventHistory};
use crate::constants::defaults;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::logging::{self, LogContext, LogLevel, LogSink};
use crate::utils::unwind::panic_message;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Handler result. Failures are only logged, so any error type is accepted.
pub type HandlerResult = anyhow::Result<()>;

type HandlerFn = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// `emit` waits for every matching handler to finish
    Awaited,
    /// `emit` returns after every matching handler has been started
    #[default]
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusConfig {
    pub enable_history: bool,
    pub max_history_size: usize,
    pub dispatch_mode: DispatchMode,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            enable_history: true,
            max_history_size: defaults::EVENT_HISTORY_SIZE,
            dispatch_mode: DispatchMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Deliver matching history to the new handler before returning
    pub replay: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventBusStats {
    pub subscriptions: usize,
    pub history_size: usize,
    pub events_emitted: u64,
    pub handler_invocations: u64,
    pub handler_failures: u64,
}

/// Events that arrive while a subscriber's replay is still running. `None` once the
/// subscriber receives live events.
type Backlog = Arc<Mutex<Option<VecDeque<Arc<Event>>>>>;

struct SubscriberEntry {
    id: u64,
    pattern: TopicPattern,
    handler: HandlerFn,
    once: bool,
    backlog: Backlog,
}

struct BusInner {
    config: EventBusConfig,
    subscribers: RwLock<Vec<SubscriberEntry>>,
    history: Mutex<EventHistory>,
    next_subscription_id: AtomicU64,
    events_emitted: AtomicU64,
    handler_invocations: AtomicU64,
    handler_failures: AtomicU64,
    log_sink: Option<Arc<dyn LogSink>>,
}

impl BusInner {
    fn remove(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|entry| entry.id != id);
        subscribers.len() != before
    }

    fn record_failure(&self, event: &Event, subscription_id: u64, reason: String) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
        error!(
            event_type = %event.event_type,
            event_id = %event.id,
            subscription_id = subscription_id,
            reason = %reason,
            "Event handler failed"
        );
        let mut context = LogContext::new();
        context.insert("event_type".to_string(), json!(event.event_type));
        context.insert("subscription_id".to_string(), json!(subscription_id));
        context.insert("reason".to_string(), json!(reason));
        logging::emit(self.log_sink.as_ref(), LogLevel::Error, "event handler failed", context);
    }
}

/// Handle returned by `subscribe`. Dropping it keeps the subscription active.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    pattern: String,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Remove the handler. Returns false when it was already gone.
    pub fn unsubscribe(&self) -> bool {
        self.bus
            .upgrade()
            .map(|bus| bus.remove(self.id))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInner")
            .field("config", &self.config)
            .field("subscriptions", &self.subscribers.read().len())
            .finish_non_exhaustive()
    }
}

/// Cloneable handle to a shared event bus
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_log_sink(config: EventBusConfig, log_sink: Arc<dyn LogSink>) -> Self {
        Self::build(config, Some(log_sink))
    }

    fn build(config: EventBusConfig, log_sink: Option<Arc<dyn LogSink>>) -> Self {
        let capacity = if config.enable_history {
            config.max_history_size
        } else {
            0
        };
        Self {
            inner: Arc::new(BusInner {
                history: Mutex::new(EventHistory::new(capacity)),
                config,
                subscribers: RwLock::new(Vec::new()),
                next_subscription_id: AtomicU64::new(1),
                events_emitted: AtomicU64::new(0),
                handler_invocations: AtomicU64::new(0),
                handler_failures: AtomicU64::new(0),
                log_sink,
            }),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    /// Register `handler` for topics matching `pattern`
    pub async fn subscribe<F, Fut>(
        &self,
        pattern: &str,
        handler: F,
        options: SubscribeOptions,
    ) -> OrchestrationResult<Subscription>
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |event| handler(event).boxed());
        self.add_subscriber(pattern, handler, false, options).await
    }

    /// Like `subscribe`, but the handler is removed after its first delivery
    pub async fn once<F, Fut>(&self, pattern: &str, handler: F) -> OrchestrationResult<Subscription>
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |event| handler(event).boxed());
        self.add_subscriber(pattern, handler, true, SubscribeOptions::default())
            .await
    }

    async fn add_subscriber(
        &self,
        pattern: &str,
        handler: HandlerFn,
        once: bool,
        options: SubscribeOptions,
    ) -> OrchestrationResult<Subscription> {
        let parsed = TopicPattern::parse(pattern)?;
        let id = self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Subscription {
            id,
            pattern: pattern.to_string(),
            bus: Arc::downgrade(&self.inner),
        };

        // Snapshot and registration share the history lock, which `publish` also holds
        // while selecting targets. Every event is either replayed or delivered live.
        let (replay, backlog) = {
            let history = self.inner.history.lock();
            let replay: Vec<Arc<Event>> = if options.replay && self.inner.config.enable_history {
                history
                    .snapshot()
                    .into_iter()
                    .filter(|event| parsed.matches(&event.event_type))
                    .collect()
            } else {
                Vec::new()
            };

            // A once-handler satisfied by replay never becomes an active subscriber
            if once && !replay.is_empty() {
                (replay, None)
            } else {
                let backlog: Backlog = Arc::new(Mutex::new((!replay.is_empty()).then(VecDeque::new)));
                self.inner.subscribers.write().push(SubscriberEntry {
                    id,
                    pattern: parsed,
                    handler: Arc::clone(&handler),
                    once,
                    backlog: Arc::clone(&backlog),
                });
                (replay, Some(backlog))
            }
        };

        let Some(backlog) = backlog else {
            invoke(&self.inner, id, &handler, Arc::clone(&replay[0])).await;
            return Ok(subscription);
        };
        debug!(pattern = pattern, subscription_id = id, replayed = replay.len(), "Subscribed");

        for event in replay {
            invoke(&self.inner, id, &handler, event).await;
        }

        loop {
            let pending: Vec<Arc<Event>> = {
                let mut queue = backlog.lock();
                let drained: Vec<Arc<Event>> = queue
                    .as_mut()
                    .map(|queue| queue.drain(..).collect())
                    .unwrap_or_default();
                if drained.is_empty() {
                    *queue = None;
                }
                drained
            };
            if pending.is_empty() {
                break;
            }
            for event in pending {
                invoke(&self.inner, id, &handler, event).await;
            }
        }

        Ok(subscription)
    }

    /// Emit an event to every matching handler
    pub async fn emit(&self, event_type: &str, data: Value) -> OrchestrationResult<Arc<Event>> {
        validate_topic(event_type)?;
        self.publish(Event::new(event_type, data)).await
    }

    /// Emit with a source label attached to the event
    pub async fn emit_from(
        &self,
        source: &str,
        event_type: &str,
        data: Value,
    ) -> OrchestrationResult<Arc<Event>> {
        validate_topic(event_type)?;
        self.publish(Event::new(event_type, data).with_source(source))
            .await
    }

    async fn publish(&self, event: Event) -> OrchestrationResult<Arc<Event>> {
        let event = Arc::new(event);
        self.inner.events_emitted.fetch_add(1, Ordering::Relaxed);

        let targets = {
            let mut history = self.inner.history.lock();
            if self.inner.config.enable_history {
                let evicted = history.push(Arc::clone(&event));
                if evicted > 0 {
                    debug!(evicted = evicted, "Event history at capacity, evicted oldest");
                }
            }
            self.take_targets(&event)
        };
        debug!(
            event_type = %event.event_type,
            event_id = %event.id,
            handlers = targets.len(),
            "Emitting event"
        );

        match self.inner.config.dispatch_mode {
            DispatchMode::Awaited => {
                for (id, handler) in targets {
                    invoke(&self.inner, id, &handler, Arc::clone(&event)).await;
                }
            }
            DispatchMode::Detached => {
                for (id, handler) in targets {
                    let inner = Arc::clone(&self.inner);
                    match start(&inner, id, &handler, Arc::clone(&event)) {
                        Some(future) => {
                            let event = Arc::clone(&event);
                            tokio::spawn(async move {
                                finish(&inner, id, &event, future).await;
                            });
                        }
                        None => continue,
                    }
                }
            }
        }

        Ok(event)
    }

    /// Matching handlers in subscription order. Once-handlers are removed under the
    /// same lock, so concurrent emits cannot both deliver to them. Subscribers still
    /// replaying get the event appended to their backlog instead.
    fn take_targets(&self, event: &Arc<Event>) -> Vec<(u64, HandlerFn)> {
        let mut subscribers = self.inner.subscribers.write();
        let mut targets = Vec::new();
        subscribers.retain(|entry| {
            if !entry.pattern.matches(&event.event_type) {
                return true;
            }
            if let Some(queue) = entry.backlog.lock().as_mut() {
                queue.push_back(Arc::clone(event));
                return true;
            }
            targets.push((entry.id, Arc::clone(&entry.handler)));
            !entry.once
        });
        targets
    }

    /// Snapshot of retained events, oldest first
    pub fn get_history(&self) -> OrchestrationResult<Vec<Arc<Event>>> {
        self.ensure_history()?;
        Ok(self.inner.history.lock().snapshot())
    }

    /// Re-deliver retained events, in original emission order, to every current
    /// subscriber whose pattern matches. `filter` limits which events are replayed.
    /// Returns the number of events replayed.
    pub async fn replay_events(&self, filter: Option<&str>) -> OrchestrationResult<usize> {
        self.ensure_history()?;
        let filter = filter.map(TopicPattern::parse).transpose()?;

        let events: Vec<Arc<Event>> = self
            .inner
            .history
            .lock()
            .snapshot()
            .into_iter()
            .filter(|event| {
                filter
                    .as_ref()
                    .map_or(true, |pattern| pattern.matches(&event.event_type))
            })
            .collect();

        for event in &events {
            let targets: Vec<(u64, HandlerFn)> = self
                .inner
                .subscribers
                .read()
                .iter()
                .filter(|entry| !entry.once && entry.pattern.matches(&event.event_type))
                .map(|entry| (entry.id, Arc::clone(&entry.handler)))
                .collect();
            for (id, handler) in targets {
                invoke(&self.inner, id, &handler, Arc::clone(event)).await;
            }
        }

        Ok(events.len())
    }

    /// Wait for the next event matching `pattern`
    pub async fn wait_for(&self, pattern: &str, timeout: Duration) -> OrchestrationResult<Arc<Event>> {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let sender = Arc::new(Mutex::new(Some(sender)));

        let subscription = self
            .once(pattern, move |event| {
                let sender = Arc::clone(&sender);
                async move {
                    if let Some(sender) = sender.lock().take() {
                        let _ = sender.send(event);
                    }
                    Ok::<(), anyhow::Error>(())
                }
            })
            .await?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(OrchestrationError::generic(format!(
                "subscription for '{pattern}' was removed before an event arrived"
            ))),
            Err(_) => {
                subscription.unsubscribe();
                Err(OrchestrationError::operation_timeout(
                    format!("waiting for event '{pattern}'"),
                    timeout,
                ))
            }
        }
    }

    /// Subscriptions registered with exactly `pattern`, or all subscriptions
    pub fn listener_count(&self, pattern: Option<&str>) -> usize {
        let subscribers = self.inner.subscribers.read();
        match pattern {
            Some(pattern) => subscribers
                .iter()
                .filter(|entry| entry.pattern.as_str() == pattern)
                .count(),
            None => subscribers.len(),
        }
    }

    /// Remove subscriptions registered with exactly `pattern`, or all of them
    pub fn remove_all_listeners(&self, pattern: Option<&str>) -> usize {
        let mut subscribers = self.inner.subscribers.write();
        let before = subscribers.len();
        match pattern {
            Some(pattern) => subscribers.retain(|entry| entry.pattern.as_str() != pattern),
            None => subscribers.clear(),
        }
        before - subscribers.len()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    pub fn stats(&self) -> EventBusStats {
        let subscriptions = self.inner.subscribers.read().len();
        let history_size = self.inner.history.lock().len();
        EventBusStats {
            subscriptions,
            history_size,
            events_emitted: self.inner.events_emitted.load(Ordering::Relaxed),
            handler_invocations: self.inner.handler_invocations.load(Ordering::Relaxed),
            handler_failures: self.inner.handler_failures.load(Ordering::Relaxed),
        }
    }

    fn ensure_history(&self) -> OrchestrationResult<()> {
        if self.inner.config.enable_history {
            Ok(())
        } else {
            Err(OrchestrationError::configuration("event history is disabled"))
        }
    }
}

/// Call the handler, catching a panic raised before its future exists
fn start(
    inner: &BusInner,
    id: u64,
    handler: &HandlerFn,
    event: Arc<Event>,
) -> Option<BoxFuture<'static, HandlerResult>> {
    inner.handler_invocations.fetch_add(1, Ordering::Relaxed);
    let event_for_error = Arc::clone(&event);
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(future) => Some(future),
        Err(panic) => {
            inner.record_failure(&event_for_error, id, panic_message(panic.as_ref()));
            None
        }
    }
}

/// Drive a started handler to completion, catching errors and panics
async fn finish(inner: &BusInner, id: u64, event: &Event, future: BoxFuture<'static, HandlerResult>) {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => inner.record_failure(event, id, format!("{err:#}")),
        Err(panic) => {
            warn!(event_type = %event.event_type, "Event handler panicked");
            inner.record_failure(event, id, panic_message(panic.as_ref()));
        }
    }
}

async fn invoke(inner: &BusInner, id: u64, handler: &HandlerFn, event: Arc<Event>) {
    if let Some(future) = start(inner, id, handler, Arc::clone(&event)) {
        finish(inner, id, &event, future).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn awaited_bus(max_history_size: usize) -> EventBus {
        EventBus::new(EventBusConfig {
            enable_history: true,
            max_history_size,
            dispatch_mode: DispatchMode::Awaited,
        })
    }

    fn counter() -> (
        Arc<AtomicUsize>,
        impl Fn(Arc<Event>) -> futures::future::Ready<HandlerResult> + Send + Sync + 'static,
    ) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, move |_event| {
            inner.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        })
    }

    #[tokio::test]
    async fn test_single_wildcard_subscription() {
        let bus = awaited_bus(10);
        let (count, handler) = counter();
        bus.subscribe("user.*", handler, SubscribeOptions::default())
            .await
            .unwrap();

        bus.emit("user.created", json!({})).await.unwrap();
        bus.emit("user.updated", json!({})).await.unwrap();
        bus.emit("order.placed", json!({})).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handlers_run_in_subscription_order() {
        let bus = awaited_bus(10);
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(
                "job.**",
                move |_| {
                    let order = order.clone();
                    async move {
                        order.lock().push(label);
                        Ok::<(), anyhow::Error>(())
                    }
                },
                SubscribeOptions::default(),
            )
            .await
            .unwrap();
        }

        bus.emit("job.done", Value::Null).await.unwrap();
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_are_isolated() {
        let bus = awaited_bus(10);
        let (count, handler) = counter();

        bus.subscribe(
            "x",
            |_| async { Err::<(), _>(anyhow::anyhow!("handler broke")) },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();
        bus.subscribe(
            "x",
            |_| async {
                if true {
                    panic!("handler exploded");
                }
                Ok::<(), anyhow::Error>(())
            },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();
        bus.subscribe("x", handler, SubscribeOptions::default())
            .await
            .unwrap();

        assert!(bus.emit("x", Value::Null).await.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().handler_failures, 2);
    }

    #[tokio::test]
    async fn test_history_keeps_most_recent() {
        let bus = awaited_bus(3);
        for n in 0..5 {
            bus.emit("tick", json!(n)).await.unwrap();
        }

        let history = bus.get_history().unwrap();
        let data: Vec<Value> = history.iter().map(|e| e.data.clone()).collect();
        assert_eq!(data, vec![json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn test_history_disabled_rejects_history_calls() {
        let bus = EventBus::new(EventBusConfig {
            enable_history: false,
            ..Default::default()
        });
        bus.emit("tick", Value::Null).await.unwrap();

        assert!(bus.get_history().is_err());
        assert!(bus.replay_events(None).await.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_with_replay_delivers_history_in_order() {
        let bus = awaited_bus(10);
        bus.emit("order.placed", json!(1)).await.unwrap();
        bus.emit("user.created", json!(2)).await.unwrap();
        bus.emit("order.shipped", json!(3)).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            "order.*",
            move |event| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(event.data.clone());
                    Ok::<(), anyhow::Error>(())
                }
            },
            SubscribeOptions { replay: true },
        )
        .await
        .unwrap();

        assert_eq!(*seen.lock(), vec![json!(1), json!(3)]);
    }

    #[tokio::test]
    async fn test_replay_events_with_filter() {
        let bus = awaited_bus(10);
        let (count, handler) = counter();
        bus.emit("a.one", Value::Null).await.unwrap();
        bus.emit("b.two", Value::Null).await.unwrap();
        bus.subscribe("**", handler, SubscribeOptions::default())
            .await
            .unwrap();

        assert_eq!(bus.replay_events(Some("a.*")).await.unwrap(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.replay_events(None).await.unwrap(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_once() {
        let bus = awaited_bus(10);
        let (count, handler) = counter();
        let subscription = bus
            .subscribe("tick", handler, SubscribeOptions::default())
            .await
            .unwrap();
        let (once_count, once_handler) = counter();
        bus.once("tick", once_handler).await.unwrap();

        bus.emit("tick", Value::Null).await.unwrap();
        bus.emit("tick", Value::Null).await.unwrap();
        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());
        bus.emit("tick", Value::Null).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(once_count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(None), 0);
    }

    #[tokio::test]
    async fn test_wait_for_resolves_and_times_out() {
        let bus = awaited_bus(10);
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.wait_for("deploy.*", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        while bus.listener_count(Some("deploy.*")) == 0 {
            tokio::task::yield_now().await;
        }
        bus.emit("deploy.finished", json!({"ok": true})).await.unwrap();

        let event = waiter.await.unwrap().unwrap();
        assert_eq!(event.event_type, "deploy.finished");

        let timed_out = bus.wait_for("never", Duration::from_millis(10)).await;
        assert_eq!(
            timed_out.unwrap_err().code(),
            crate::error::ErrorCode::OperationTimeout
        );
        assert_eq!(bus.listener_count(Some("never")), 0);
    }

    #[tokio::test]
    async fn test_detached_dispatch_returns_before_completion() {
        let bus = EventBus::new(EventBusConfig::default());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let done_tx = Arc::new(Mutex::new(Some(done_tx)));

        bus.subscribe(
            "slow",
            move |_| {
                let release = release_rx.lock().take();
                let done = done_tx.lock().take();
                async move {
                    if let Some(release) = release {
                        let _ = release.await;
                    }
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    Ok::<(), anyhow::Error>(())
                }
            },
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

        bus.emit("slow", Value::Null).await.unwrap();
        release_tx.send(()).unwrap();
        done_rx.await.unwrap();
        assert_eq!(bus.stats().handler_invocations, 1);
    }

    #[tokio::test]
    async fn test_remove_all_listeners_by_pattern() {
        let bus = awaited_bus(10);
        let (_, a) = counter();
        let (_, b) = counter();
        bus.subscribe("a", a, SubscribeOptions::default()).await.unwrap();
        bus.subscribe("b", b, SubscribeOptions::default()).await.unwrap();

        assert_eq!(bus.remove_all_listeners(Some("a")), 1);
        assert_eq!(bus.listener_count(None), 1);
        bus.clear_history();
        assert_eq!(bus.stats().history_size, 0);
    }

    #[tokio::test]
    async fn test_invalid_inputs_rejected() {
        let bus = awaited_bus(10);
        assert!(bus.emit("bad..topic", Value::Null).await.is_err());
        let (_, handler) = counter();
        assert!(bus
            .subscribe("bad*", handler, SubscribeOptions::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_events_emitted_during_replay_follow_it() {
        let bus = awaited_bus(10);
        bus.emit("job.done", json!({"n": 1})).await.unwrap();

        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscribing = {
            let bus = bus.clone();
            let (entered, release, seen) = (entered.clone(), release.clone(), seen.clone());
            tokio::spawn(async move {
                bus.subscribe(
                    "job.*",
                    move |event| {
                        let (entered, release, seen) = (entered.clone(), release.clone(), seen.clone());
                        async move {
                            let n = event.data["n"].as_i64().unwrap_or_default();
                            if n == 1 {
                                entered.notify_one();
                                release.notified().await;
                            }
                            seen.lock().push(n);
                            Ok::<(), anyhow::Error>(())
                        }
                    },
                    SubscribeOptions { replay: true },
                )
                .await
            })
        };

        entered.notified().await;
        bus.emit("job.done", json!({"n": 2})).await.unwrap();
        release.notify_one();
        subscribing.await.unwrap().unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);

        bus.emit("job.done", json!({"n": 3})).await.unwrap();
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(bus.stats().handler_invocations, 3);
    }
}
