//! In-process publish/subscribe fan-out.
//!
//! Each channel is a `tokio::sync::broadcast` channel, so every subscriber gets
//! its own bounded backlog. Publishing never waits: when a slow subscriber's
//! backlog is full the oldest undelivered event is overwritten and the
//! subscriber logs the loss the next time it reads.

use crate::error::{ForemanError, ForemanResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

/// Per-subscriber backlog used by [`EventBus::default`].
pub const DEFAULT_BUFFER: usize = 256;

/// Well-known channel names.
pub mod channels {
    /// Task transitions and workflow state changes.
    pub const WORKFLOW_UPDATES: &str = "workflow.updates";
    /// Allocation requests the ledger could not satisfy.
    pub const RESOURCE_CONFLICTS: &str = "resource.conflicts";
    /// Utilization crossing the configured threshold.
    pub const RESOURCE_ALERTS: &str = "resource.alerts";
    /// Dependents unblocked or cascaded by the dependency gate.
    pub const DEPENDENCY_GATE: &str = "dependency.gate";
}

/// A single published message. Ephemeral: the bus never stores it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub channel: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(channel: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Boxed event stream handed out by [`PubSubTransport::subscribe`].
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Channel-keyed broadcast bus.
pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<Event>>>,
    buffer: usize,
    published: AtomicU64,
}

impl EventBus {
    /// Create a bus whose subscribers each hold at most `buffer` undelivered events.
    pub fn new(buffer: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
            published: AtomicU64::new(0),
        }
    }

    /// Fan an event out to the current subscribers of `channel`.
    ///
    /// Returns how many subscribers it reached. With nobody listening the
    /// event is simply discarded.
    pub fn publish(&self, channel: &str, payload: serde_json::Value) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let sender = self.channels.read().get(channel).cloned();
        match sender {
            Some(tx) => {
                let delivered = tx.send(Event::new(channel, payload)).unwrap_or(0);
                debug!(channel, delivered, "Event published");
                delivered
            }
            None => 0,
        }
    }

    /// Subscribe to `channel`. Only events published after this call are seen.
    pub fn subscribe(&self, channel: &str) -> Subscription {
        let rx = {
            let mut channels = self.channels.write();
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(self.buffer).0)
                .subscribe()
        };
        Subscription {
            channel: channel.to_string(),
            rx,
            dropped: 0,
        }
    }

    /// Live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Total `publish` calls since creation.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("channels", &self.channels.read().len())
            .field("buffer", &self.buffer)
            .field("published", &self.published_count())
            .finish()
    }
}

/// One subscriber's view of a channel.
pub struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Event>,
    dropped: u64,
}

impl Subscription {
    /// Channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Events lost to backlog overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Wait for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => self.note_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => self.note_lag(n),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a stream; lag is logged and skipped.
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        let channel = self.channel;
        BroadcastStream::new(self.rx).filter_map(move |item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                warn!(channel = %channel, dropped = n, "Subscriber lagging, oldest events dropped");
                None
            }
        })
    }

    fn note_lag(&mut self, n: u64) {
        self.dropped += n;
        warn!(channel = %self.channel, dropped = n, "Subscriber lagging, oldest events dropped");
    }
}

// ---------------------------------------------------------------------------
// External broker delegation
// ---------------------------------------------------------------------------

/// An external message broker the bus can mirror into.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Publish one payload on `channel`.
    async fn publish(&self, channel: &str, payload: &serde_json::Value) -> ForemanResult<()>;
    /// Stream events arriving on `channel`.
    async fn subscribe(&self, channel: &str) -> ForemanResult<EventStream>;
}

#[async_trait]
impl PubSubTransport for EventBus {
    async fn publish(&self, channel: &str, payload: &serde_json::Value) -> ForemanResult<()> {
        EventBus::publish(self, channel, payload.clone());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> ForemanResult<EventStream> {
        Ok(Box::pin(EventBus::subscribe(self, channel).into_stream()))
    }
}

/// Pump every event from `subscription` into `transport` until the bus closes.
///
/// Transport failures are logged and the event is skipped; the bus side is
/// never slowed down by the broker.
pub fn forward(mut subscription: Subscription, transport: Arc<dyn PubSubTransport>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if let Err(e) = transport.publish(&event.channel, &event.payload).await {
                warn!(channel = %event.channel, error = %e, "Broker publish failed");
            }
        }
        debug!(channel = %subscription.channel, "Forwarder stopped");
    })
}

/// Parse an event payload back into a typed value.
pub fn decode<T: serde::de::DeserializeOwned>(event: &Event) -> ForemanResult<T> {
    serde_json::from_value(event.payload.clone()).map_err(ForemanError::from)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(channels::WORKFLOW_UPDATES);

        let delivered = bus.publish(channels::WORKFLOW_UPDATES, json!({"status": "running"}));
        assert_eq!(delivered, 1);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.channel, "workflow.updates");
        assert_eq!(event.payload["status"], "running");
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = EventBus::default();
        let mut updates = bus.subscribe(channels::WORKFLOW_UPDATES);
        let mut conflicts = bus.subscribe(channels::RESOURCE_CONFLICTS);

        bus.publish(channels::RESOURCE_CONFLICTS, json!({"id": 1}));

        assert!(updates.try_recv().is_none());
        assert_eq!(conflicts.try_recv().unwrap().payload["id"], 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::default();
        assert_eq!(bus.publish("x", json!(1)), 0);

        let mut sub = bus.subscribe("x");
        assert!(sub.try_recv().is_none());
        bus.publish("x", json!(2));
        assert_eq!(sub.try_recv().unwrap().payload, json!(2));
        assert_eq!(bus.published_count(), 2);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe("x");
        let mut fast = bus.subscribe("x");

        for n in 0..5 {
            // Never blocks, even though `slow` is not reading.
            bus.publish("x", json!(n));
            assert_eq!(fast.recv().await.unwrap().payload, json!(n));
        }

        assert_eq!(slow.recv().await.unwrap().payload, json!(3));
        assert_eq!(slow.recv().await.unwrap().payload, json!(4));
        assert_eq!(slow.dropped(), 3);
        assert_eq!(fast.dropped(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_count() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count("x"), 0);
        let a = bus.subscribe("x");
        let _b = bus.subscribe("x");
        assert_eq!(bus.subscriber_count("x"), 2);
        drop(a);
        assert_eq!(bus.subscriber_count("x"), 1);
    }

    #[tokio::test]
    async fn test_stream_skips_lag() {
        let bus = EventBus::new(1);
        let sub = bus.subscribe("x");
        bus.publish("x", json!("old"));
        bus.publish("x", json!("new"));

        let mut stream = Box::pin(sub.into_stream());
        let event = stream.next().await.unwrap();
        assert_eq!(event.payload, json!("new"));
    }

    struct RecordingTransport {
        seen: tokio::sync::Mutex<Vec<(String, serde_json::Value)>>,
    }

    #[async_trait]
    impl PubSubTransport for RecordingTransport {
        async fn publish(&self, channel: &str, payload: &serde_json::Value) -> ForemanResult<()> {
            self.seen.lock().await.push((channel.to_string(), payload.clone()));
            Ok(())
        }

        async fn subscribe(&self, _channel: &str) -> ForemanResult<EventStream> {
            Err(ForemanError::Service("recording transport is write-only".into()))
        }
    }

    #[tokio::test]
    async fn test_forward_to_transport() {
        let bus = Arc::new(EventBus::default());
        let transport = Arc::new(RecordingTransport {
            seen: tokio::sync::Mutex::new(Vec::new()),
        });
        let handle = forward(bus.subscribe("alerts"), transport.clone());

        bus.publish("alerts", json!({"utilization": 0.95}));
        bus.publish("alerts", json!({"utilization": 0.97}));

        for _ in 0..50 {
            if transport.seen.lock().await.len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let seen = transport.seen.lock().await.clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "alerts");
        assert_eq!(seen[1].1["utilization"], 0.97);
        handle.abort();
    }

    #[tokio::test]
    async fn test_bus_as_transport() {
        let bus = EventBus::default();
        let mut stream = PubSubTransport::subscribe(&bus, "x").await.unwrap();
        PubSubTransport::publish(&bus, "x", &json!({"k": "v"})).await.unwrap();
        let event = stream.next().await.unwrap();
        assert_eq!(event.payload["k"], "v");

        #[derive(serde::Deserialize)]
        struct Kv {
            k: String,
        }
        let kv: Kv = decode(&event).unwrap();
        assert_eq!(kv.k, "v");
    }
}
