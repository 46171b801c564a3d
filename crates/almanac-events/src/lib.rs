//! In-process pub/sub for the almanac dataset node.
//!
//! Events are a flat enumeration ([`EventType`]) with opaque JSON payloads.
//! Publishing is synchronous: every matching handler runs, in FIFO
//! subscription order, before `publish` returns. Handler errors are logged
//! and never abort fan-out, so one misbehaving subscriber cannot hide an
//! event from the others.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Boxed error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>> + Send + Sync>;

/// The flat enumeration of event types carried by the bus.
///
/// Serialized as kebab-case strings; these are the `type` values seen on the
/// WebSocket wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    SaveStarted,
    SaveProgress,
    SaveCompleted,
    PushStarted,
    PushCompleted,
    PullStarted,
    PullProgress,
    PullCompleted,
    WorkspaceInit,
    WorkspaceCheckout,
    WorkspaceWrite,
    WorkspaceUnlink,
    CronStarted,
    CronCompleted,
}

/// A single published event.
///
/// `ts` is unix nanoseconds. `session_id` is empty for events that are not
/// tied to a client session. The payload is opaque to the bus; consumers
/// type-check per event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub typ: EventType,
    pub ts: i64,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub data: serde_json::Value,
}

enum Filter {
    All,
    Types(HashSet<EventType>),
    Session(String),
}

impl Filter {
    fn matches(&self, event: &Event) -> bool {
        match self {
            Filter::All => true,
            Filter::Types(types) => types.contains(&event.typ),
            Filter::Session(id) => event.session_id == *id,
        }
    }
}

/// Handle to one subscription, for removal when the subscriber goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: u64,
    filter: Filter,
    handler: Handler,
}

/// In-process event bus.
///
/// `Bus` is `Clone`; clones share the subscriber list. Long-lived
/// subscribers are torn down with the bus when the owning instance shuts
/// down ([`Bus::clear`]); per-connection subscribers remove themselves with
/// [`Bus::unsubscribe`] so a closed connection's handler is not invoked on
/// every later publish.
///
/// Handlers must not block indefinitely: long work belongs on a worker task
/// owned by the handler, since `publish` awaits each handler in turn.
#[derive(Clone)]
pub struct Bus {
    subs: Arc<RwLock<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
    now_ns: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl Bus {
    /// Create a bus stamping events with the system clock.
    pub fn new() -> Self {
        Self::with_now(|| {
            chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default()
        })
    }

    /// Create a bus with an injected timestamp source (deterministic tests).
    pub fn with_now(now_ns: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        Self {
            subs: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            now_ns: Arc::new(now_ns),
        }
    }

    /// Subscribe `handler` to the listed event types.
    ///
    /// An empty type list subscribes to all events.
    pub async fn subscribe<F, Fut>(&self, types: &[EventType], handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let filter = if types.is_empty() {
            Filter::All
        } else {
            Filter::Types(types.iter().copied().collect())
        };
        self.push_subscription(filter, handler).await
    }

    /// Subscribe `handler` to every event carrying the given session id.
    pub async fn subscribe_session<F, Fut>(&self, session_id: &str, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.push_subscription(Filter::Session(session_id.to_string()), handler)
            .await
    }

    async fn push_subscription<F, Fut>(&self, filter: Filter, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.write().await.push(Subscription { id, filter, handler });
        SubscriptionId(id)
    }

    /// Remove one subscription. Returns false when the id was already gone.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subs.write().await;
        let before = subs.len();
        subs.retain(|sub| sub.id != id.0);
        subs.len() != before
    }

    /// Publish an event with no session attribution.
    ///
    /// Every matching handler is invoked, synchronously and in subscription
    /// order, before this returns. A handler error is logged and fan-out
    /// continues with the next subscriber.
    pub async fn publish(&self, ctx: &CancellationToken, typ: EventType, data: serde_json::Value) {
        self.publish_event(
            ctx,
            Event {
                typ,
                ts: (self.now_ns)(),
                session_id: String::new(),
                data,
            },
        )
        .await;
    }

    /// Publish an event attributed to a client session.
    pub async fn publish_for_session(
        &self,
        ctx: &CancellationToken,
        session_id: &str,
        typ: EventType,
        data: serde_json::Value,
    ) {
        self.publish_event(
            ctx,
            Event {
                typ,
                ts: (self.now_ns)(),
                session_id: session_id.to_string(),
                data,
            },
        )
        .await;
    }

    async fn publish_event(&self, ctx: &CancellationToken, event: Event) {
        // Hold the read lock across fan-out so a single publish observes a
        // stable subscriber list; subscriptions made mid-publish see only
        // later events.
        let subs = self.subs.read().await;
        for sub in subs.iter() {
            if ctx.is_cancelled() {
                return;
            }
            if !sub.filter.matches(&event) {
                continue;
            }
            if let Err(err) = (sub.handler)(event.clone()).await {
                warn!(event = ?event.typ, error = %err, "event handler failed");
            }
        }
    }

    /// Drop all subscriptions. Called on instance teardown.
    pub async fn clear(&self) {
        self.subs.write().await.clear();
    }

    /// Number of live subscriptions (diagnostics and tests).
    pub async fn subscriber_count(&self) -> usize {
        self.subs.read().await.len()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscriber() {
        let bus = Bus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        bus.subscribe(&[EventType::SaveCompleted], move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        bus.publish(&ctx(), EventType::SaveCompleted, serde_json::json!({"ref": "a/b"}))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_cross_type_dispatch() {
        let bus = Bus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        bus.subscribe(&[EventType::PullStarted], move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        bus.publish(&ctx(), EventType::SaveStarted, serde_json::Value::Null)
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_type_list_subscribes_to_all() {
        let bus = Bus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        bus.subscribe(&[], move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        bus.publish(&ctx(), EventType::SaveStarted, serde_json::Value::Null)
            .await;
        bus.publish(&ctx(), EventType::PullCompleted, serde_json::Value::Null)
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = Bus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        bus.subscribe(&[], move |event| {
            let s = s.clone();
            async move {
                s.lock().unwrap().push(event.data.as_i64().unwrap());
                Ok(())
            }
        })
        .await;

        for i in 0..20 {
            bus.publish(&ctx(), EventType::SaveProgress, serde_json::json!(i))
                .await;
        }
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn handlers_run_in_subscription_order() {
        let bus = Bus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let s = seen.clone();
            bus.subscribe(&[], move |_| {
                let s = s.clone();
                async move {
                    s.lock().unwrap().push(tag);
                    Ok(())
                }
            })
            .await;
        }

        bus.publish(&ctx(), EventType::SaveStarted, serde_json::Value::Null)
            .await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn handler_error_does_not_abort_fanout() {
        let bus = Bus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(&[], move |_| async move {
            Err::<(), HandlerError>("boom".into())
        })
        .await;

        let c = count.clone();
        bus.subscribe(&[], move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        bus.publish(&ctx(), EventType::SaveStarted, serde_json::Value::Null)
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_filter_only_sees_its_session() {
        let bus = Bus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        bus.subscribe_session("sess-1", move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        bus.publish_for_session(&ctx(), "sess-1", EventType::PullStarted, serde_json::Value::Null)
            .await;
        bus.publish_for_session(&ctx(), "sess-2", EventType::PullStarted, serde_json::Value::Null)
            .await;
        bus.publish(&ctx(), EventType::PullStarted, serde_json::Value::Null)
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_context_stops_fanout() {
        let bus = Bus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        bus.subscribe(&[], move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        bus.publish(&cancelled, EventType::SaveStarted, serde_json::Value::Null)
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn clear_drops_subscribers() {
        let bus = Bus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        bus.subscribe(&[], move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;
        assert_eq!(bus.subscriber_count().await, 1);

        bus.clear().await;
        assert_eq!(bus.subscriber_count().await, 0);

        bus.publish(&ctx(), EventType::SaveStarted, serde_json::Value::Null)
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_its_own_subscription() {
        let bus = Bus::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let c = first.clone();
        let first_id = bus
            .subscribe(&[], move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        let c = second.clone();
        bus.subscribe(&[], move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(bus.unsubscribe(first_id).await);
        assert_eq!(bus.subscriber_count().await, 1);

        bus.publish(&ctx(), EventType::SaveStarted, serde_json::Value::Null)
            .await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        // Already removed: a second unsubscribe is a no-op.
        assert!(!bus.unsubscribe(first_id).await);
    }

    #[tokio::test]
    async fn injected_timestamps_are_deterministic() {
        let bus = Bus::with_now(|| 42);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        bus.subscribe(&[], move |event| {
            let s = s.clone();
            async move {
                s.lock().unwrap().push(event.ts);
                Ok(())
            }
        })
        .await;

        bus.publish(&ctx(), EventType::SaveStarted, serde_json::Value::Null)
            .await;
        assert_eq!(*seen.lock().unwrap(), vec![42]);
    }

    #[test]
    fn event_type_wire_form_is_kebab_case() {
        let json = serde_json::to_string(&EventType::SaveStarted).unwrap();
        assert_eq!(json, "\"save-started\"");
        let json = serde_json::to_string(&EventType::WorkspaceCheckout).unwrap();
        assert_eq!(json, "\"workspace-checkout\"");
    }

    #[test]
    fn event_envelope_field_names() {
        let event = Event {
            typ: EventType::PullCompleted,
            ts: 7,
            session_id: "abc".into(),
            data: serde_json::json!({"x": 1}),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "pull-completed");
        assert_eq!(value["ts"], 7);
        assert_eq!(value["sessionID"], "abc");
        assert_eq!(value["data"]["x"], 1);
    }
}
