//! Named-event fan-out.
//!
//! Handlers register per [`EventType`] (or for every event with
//! [`EventDispatcher::on_any`]) and run synchronously, in registration
//! order, for each dispatched record. Dispatch is serialized by a reentrant
//! gate: a handler may register, unregister, or close the owning connection
//! from inside a callback, and no two records are ever delivered at once.
//!
//! Registration is forward-only. A handler added while a record is being
//! dispatched does not see that record.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use pulse_coord::{DebounceOptions, Debounced, ThrottleOptions, Throttled};
use pulse_core::events::{EventRecord, EventType};
use tracing::{debug, trace};

/// Shared handler callback.
pub type Handler = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// Identifies one registration, for [`EventDispatcher::off`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Clone, Debug, PartialEq, Eq)]
enum Topic {
    Event(EventType),
    Any,
}

impl Topic {
    fn matches(&self, event_type: &EventType) -> bool {
        match self {
            Self::Event(t) => t == event_type,
            Self::Any => true,
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    handler: Handler,
}

struct DispatcherInner {
    subscriptions: Mutex<Vec<Subscription>>,
    gate: ReentrantMutex<()>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl DispatcherInner {
    fn is_registered(&self, id: SubscriptionId) -> bool {
        self.subscriptions.lock().iter().any(|s| s.id == id)
    }

    /// Deliver a rate-shaped record outside the normal dispatch path.
    fn deliver_deferred(&self, id: SubscriptionId, record: &EventRecord, handler: &Handler) {
        let _gate = self.gate.lock();
        if self.closed.load(Ordering::Acquire) || !self.is_registered(id) {
            return;
        }
        handler(record);
    }
}

/// Typed publish/subscribe registry for one connection.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl EventDispatcher {
    /// An open dispatcher with no handlers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                subscriptions: Mutex::new(Vec::new()),
                gate: ReentrantMutex::new(()),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn register(&self, id: SubscriptionId, topic: Topic, handler: Handler) -> SubscriptionId {
        if self.is_closed() {
            debug!(?topic, "dispatcher closed, registration ignored");
            return id;
        }
        trace!(?topic, ?id, "handler registered");
        self.inner.subscriptions.lock().push(Subscription { id, topic, handler });
        id
    }

    /// Register `handler` for `event`.
    pub fn on(
        &self,
        event: impl Into<EventType>,
        handler: impl Fn(&EventRecord) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.register(self.next_id(), Topic::Event(event.into()), Arc::new(handler))
    }

    /// Register `handler` for every event, reserved ones included.
    pub fn on_any(&self, handler: impl Fn(&EventRecord) + Send + Sync + 'static) -> SubscriptionId {
        self.register(self.next_id(), Topic::Any, Arc::new(handler))
    }

    /// Register `handler` for `event`, invoked at most once per throttle window.
    pub fn on_throttled(
        &self,
        event: impl Into<EventType>,
        options: ThrottleOptions,
        handler: impl Fn(&EventRecord) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        let weak = Arc::downgrade(&self.inner);
        let handler: Handler = Arc::new(handler);
        let throttled = Throttled::new(options, move |record: EventRecord| {
            deliver(&weak, id, &record, &handler);
        });
        self.register(id, Topic::Event(event.into()), Arc::new(move |record: &EventRecord| {
            throttled.call(record.clone());
        }))
    }

    /// Register `handler` for `event`, invoked once arrivals pause.
    pub fn on_debounced(
        &self,
        event: impl Into<EventType>,
        options: DebounceOptions,
        handler: impl Fn(&EventRecord) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        let weak = Arc::downgrade(&self.inner);
        let handler: Handler = Arc::new(handler);
        let debounced = Debounced::new(options, move |record: EventRecord| {
            deliver(&weak, id, &record, &handler);
        });
        self.register(id, Topic::Event(event.into()), Arc::new(move |record: &EventRecord| {
            debounced.call(record.clone());
        }))
    }

    /// Remove one registration. Returns whether it existed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.inner.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        before != subscriptions.len()
    }

    /// Deliver `record` to every matching handler, in registration order.
    pub fn dispatch(&self, record: &EventRecord) {
        let _gate = self.inner.gate.lock();
        if self.is_closed() {
            return;
        }

        let event_type = record.event_type();
        let matching: Vec<(SubscriptionId, Handler)> = self
            .inner
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.topic.matches(event_type))
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();
        trace!(%event_type, handlers = matching.len(), "dispatching");

        for (id, handler) in matching {
            if self.is_closed() {
                break;
            }
            // A handler earlier in this pass may have unregistered it.
            if !self.inner.is_registered(id) {
                continue;
            }
            handler(record);
        }
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Whether [`EventDispatcher::shutdown`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop delivering and drop every handler. Idempotent.
    ///
    /// Waits for an in-progress dispatch on another thread to finish.
    pub fn shutdown(&self) {
        let _gate = self.inner.gate.lock();
        self.inner.closed.store(true, Ordering::Release);
        let dropped = std::mem::take(&mut *self.inner.subscriptions.lock());
        if !dropped.is_empty() {
            debug!(handlers = dropped.len(), "dispatcher shut down");
        }
    }

    /// Hold the dispatch gate. Nothing is delivered while the guard lives,
    /// except reentrantly from the holding thread.
    pub(crate) fn hold(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.gate.lock()
    }
}

fn deliver(weak: &Weak<DispatcherInner>, id: SubscriptionId, record: &EventRecord, handler: &Handler) {
    if let Some(inner) = weak.upgrade() {
        inner.deliver_deferred(id, record, handler);
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handler_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::events::{ReservedEvent, ServerEvent};
    use serde_json::json;
    use std::time::Duration;

    fn record(name: &str) -> EventRecord {
        EventRecord::server(name, json!({"name": name}), None)
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::default()
    }

    fn push(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> impl Fn(&EventRecord) + Send + Sync + 'static {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        move |r| log.lock().push(format!("{tag}:{}", r.event_type()))
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let seen = log();
        let _ = dispatcher.on(ServerEvent::Token, push(&seen, "a"));
        let _ = dispatcher.on(ServerEvent::Token, push(&seen, "b"));
        let _ = dispatcher.on(ServerEvent::Done, push(&seen, "c"));

        dispatcher.dispatch(&record("token"));
        dispatcher.dispatch(&record("done"));

        assert_eq!(*seen.lock(), vec!["a:token", "b:token", "c:done"]);
    }

    #[test]
    fn off_removes_only_that_handler() {
        let dispatcher = EventDispatcher::new();
        let seen = log();
        let a = dispatcher.on("token", push(&seen, "a"));
        let _ = dispatcher.on("token", push(&seen, "b"));

        assert!(dispatcher.off(a));
        assert!(!dispatcher.off(a));
        dispatcher.dispatch(&record("token"));

        assert_eq!(*seen.lock(), vec!["b:token"]);
    }

    #[test]
    fn on_any_sees_everything() {
        let dispatcher = EventDispatcher::new();
        let seen = log();
        let _ = dispatcher.on_any(push(&seen, "any"));

        dispatcher.dispatch(&record("progress"));
        dispatcher.dispatch(&EventRecord::server("custom", json!(null), None));

        assert_eq!(*seen.lock(), vec!["any:progress", "any:custom"]);
    }

    #[test]
    fn reserved_and_server_names_do_not_collide() {
        let dispatcher = EventDispatcher::new();
        let seen = log();
        let _ = dispatcher.on(ReservedEvent::ConnectionClosed, push(&seen, "reserved"));

        dispatcher.dispatch(&record("connection-closed"));

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn registration_during_dispatch_is_forward_only() {
        let dispatcher = EventDispatcher::new();
        let seen = log();
        let inner_dispatcher = dispatcher.clone();
        let inner_seen = Arc::clone(&seen);
        let _ = dispatcher.on("token", move |_| {
            let _ = inner_dispatcher.on("token", push(&inner_seen, "late"));
        });

        dispatcher.dispatch(&record("token"));
        assert!(seen.lock().is_empty());

        dispatcher.dispatch(&record("token"));
        assert_eq!(*seen.lock(), vec!["late:token"]);
    }

    #[test]
    fn handler_removed_mid_dispatch_is_skipped() {
        let dispatcher = EventDispatcher::new();
        let seen = log();
        let victim = Arc::new(Mutex::new(None));
        let remover = dispatcher.clone();
        let target = Arc::clone(&victim);
        let _ = dispatcher.on("token", move |_| {
            if let Some(id) = *target.lock() {
                let _ = remover.off(id);
            }
        });
        *victim.lock() = Some(dispatcher.on("token", push(&seen, "victim")));

        dispatcher.dispatch(&record("token"));

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn shutdown_from_handler_stops_delivery() {
        let dispatcher = EventDispatcher::new();
        let seen = log();
        let closer = dispatcher.clone();
        let _ = dispatcher.on("token", move |_| closer.shutdown());
        let _ = dispatcher.on("token", push(&seen, "after"));

        dispatcher.dispatch(&record("token"));
        dispatcher.dispatch(&record("token"));

        assert!(seen.lock().is_empty());
        assert!(dispatcher.is_closed());
        assert_eq!(dispatcher.handler_count(), 0);
    }

    #[test]
    fn registration_after_shutdown_is_ignored() {
        let dispatcher = EventDispatcher::new();
        dispatcher.shutdown();
        let _ = dispatcher.on("token", |_| {});
        assert_eq!(dispatcher.handler_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_handler_coalesces() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _ = dispatcher.on_throttled(
            ServerEvent::Progress,
            ThrottleOptions::new(Duration::from_millis(500)),
            move |r| sink.lock().push(r.payload()["pct"].as_u64().unwrap_or_default()),
        );

        for pct in [10, 20, 30, 40] {
            dispatcher.dispatch(&EventRecord::server("progress", json!({"pct": pct}), None));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*seen.lock(), vec![10, 40]);
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_handler_silent_after_shutdown() {
        let dispatcher = EventDispatcher::new();
        let seen = log();
        let _ = dispatcher.on_debounced(
            ServerEvent::Token,
            DebounceOptions::new(Duration::from_millis(300)),
            push(&seen, "debounced"),
        );

        dispatcher.dispatch(&record("token"));
        dispatcher.shutdown();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_handler_fires_once() {
        let dispatcher = EventDispatcher::new();
        let seen = log();
        let _ = dispatcher.on_debounced(
            ServerEvent::Token,
            DebounceOptions::new(Duration::from_millis(300)),
            push(&seen, "debounced"),
        );

        for _ in 0..3 {
            dispatcher.dispatch(&record("token"));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*seen.lock(), vec!["debounced:token"]);
    }
}
