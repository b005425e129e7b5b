//! Cross-node relay of [`SyncEvent`]s over a shared pub/sub medium.
//!
//! A bridge owns two capability-scoped handles to the same backend: a
//! [`BrokerPublisher`] that only sends, and a [`BrokerSubscriber`] that only
//! listens. Many pub/sub media refuse ordinary commands on a subscribing
//! connection, so the two are never merged. Every outbound event is wrapped
//! in a [`BrokerEnvelope`] carrying the publishing node's [`OriginTag`];
//! inbound envelopes carrying the local tag are dropped by [`is_echo`]
//! before any handler runs.

pub mod memory;
#[cfg(feature = "redis-broker")]
pub mod redis_pubsub;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::SyncEvent;
use crate::metrics::broker_metrics;

/// Channel names shared by every node.
pub mod channels {
    pub const GLOBAL: &str = "global";
    pub const CORPORATIONS: &str = "corporations";
    pub const LEADERBOARD: &str = "leaderboard";

    /// Subscribed eagerly by [`super::BrokerBridge::init`].
    pub const BASELINE: [&str; 3] = [GLOBAL, CORPORATIONS, LEADERBOARD];

    pub fn shard(shard_id: &str) -> String {
        format!("shard:{shard_id}")
    }

    pub fn corp(corp_id: &str) -> String {
        format!("corp:{corp_id}")
    }

    pub fn raid(raid_id: &str) -> String {
        format!("raid:{raid_id}")
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker command failed: {0}")]
    Command(String),
    #[error("broker handle is closed")]
    Closed,
    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[cfg(feature = "redis-broker")]
impl From<::redis::RedisError> for BrokerError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

/// Identity of the node that published an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginTag(String);

impl OriginTag {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self(node_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OriginTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker wire format: `{sourceNode, event}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerEnvelope {
    pub source_node: OriginTag,
    pub event: SyncEvent,
}

/// The single echo guard. Every inbound envelope passes through here before
/// a handler sees it.
pub fn is_echo(envelope: &BrokerEnvelope, local: &OriginTag) -> bool {
    envelope.source_node == *local
}

/// Raw message as delivered by a backend.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub payload: String,
}

/// Publish-only handle.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError>;

    async fn subscriber_count(&self, channel: &str) -> Result<usize, BrokerError>;

    async fn ping(&self) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Subscribe-only handle.
#[async_trait]
pub trait BrokerSubscriber: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError>;

    /// Hands out the inbound stream. Only the first call returns `Some`.
    async fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Receives every non-echo inbound event on any subscribed channel.
#[async_trait]
pub trait BrokerHandler: Send + Sync {
    async fn handle(&self, channel: &str, event: SyncEvent);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// `redis://` URL; `None` selects the in-process fallback.
    pub redis_url: Option<String>,
}

impl BrokerSettings {
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty()),
        }
    }
}

pub struct BrokerBridge {
    origin: OriginTag,
    publisher: Arc<dyn BrokerPublisher>,
    subscriber: Arc<dyn BrokerSubscriber>,
    channels: Mutex<BTreeSet<String>>,
    shutting_down: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BrokerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerBridge")
            .field("origin", &self.origin)
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl BrokerBridge {
    pub fn new(
        node_id: impl Into<String>,
        publisher: Arc<dyn BrokerPublisher>,
        subscriber: Arc<dyn BrokerSubscriber>,
    ) -> Self {
        Self {
            origin: OriginTag::new(node_id),
            publisher,
            subscriber,
            channels: Mutex::new(BTreeSet::new()),
            shutting_down: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
        }
    }

    /// Opens the configured backend. With no redis URL an isolated
    /// in-process hub is used, so a single node behaves the same either way.
    pub async fn connect(settings: &BrokerSettings, node_id: &str) -> Result<Self, BrokerError> {
        match settings.redis_url.as_deref() {
            #[cfg(feature = "redis-broker")]
            Some(url) => {
                let (publisher, subscriber) = redis_pubsub::connect(url).await?;
                info!(node_id, "broker: redis backend connected");
                Ok(Self::new(node_id, Arc::new(publisher), Arc::new(subscriber)))
            }
            #[cfg(not(feature = "redis-broker"))]
            Some(_) => Err(BrokerError::Connection(
                "redis support not compiled in".to_string(),
            )),
            None => {
                let (publisher, subscriber) = memory::MemoryHub::default().connect();
                info!(node_id, "broker: no redis configured, using in-process fallback");
                Ok(Self::new(node_id, Arc::new(publisher), Arc::new(subscriber)))
            }
        }
    }

    pub fn node_id(&self) -> &str {
        self.origin.as_str()
    }

    pub fn origin(&self) -> &OriginTag {
        &self.origin
    }

    /// Subscribes the baseline channels.
    pub async fn init(&self) -> Result<(), BrokerError> {
        for channel in channels::BASELINE {
            self.subscribe_tracked(channel).await?;
        }
        info!(node_id = %self.origin, channels = ?channels::BASELINE, "broker: baseline subscriptions ready");
        Ok(())
    }

    /// Lazily subscribes `channel` the first time this node needs it.
    /// Failures are logged; the caller's local work carries on.
    pub async fn ensure_subscribed(&self, channel: &str) {
        if self.channels.lock().await.contains(channel) {
            return;
        }
        if let Err(err) = self.subscribe_tracked(channel).await {
            if !self.is_shutting_down() {
                warn!(%err, channel, "broker: lazy subscribe failed");
            }
        }
    }

    /// Drops a lazily-added subscription. The channel set stays locked until
    /// the backend has unsubscribed, so a concurrent `ensure_subscribed`
    /// always lands after it.
    pub async fn release(&self, channel: &str) {
        if channels::BASELINE.contains(&channel) {
            return;
        }
        let mut tracked = self.channels.lock().await;
        if !tracked.remove(channel) {
            return;
        }
        broker_metrics().subscribed_channels.set(tracked.len() as i64);
        if let Err(err) = self.subscriber.unsubscribe(channel).await {
            if !self.is_shutting_down() {
                warn!(%err, channel, "broker: unsubscribe failed");
            }
        }
        debug!(channel, "broker: released");
    }

    async fn subscribe_tracked(&self, channel: &str) -> Result<(), BrokerError> {
        if self.is_shutting_down() {
            return Err(BrokerError::Closed);
        }
        let mut tracked = self.channels.lock().await;
        if tracked.contains(channel) {
            return Ok(());
        }
        self.subscriber.subscribe(channel).await?;
        tracked.insert(channel.to_string());
        broker_metrics().subscribed_channels.set(tracked.len() as i64);
        debug!(channel, "broker: subscribed");
        Ok(())
    }

    pub async fn is_subscribed(&self, channel: &str) -> bool {
        self.channels.lock().await.contains(channel)
    }

    pub async fn subscribed_channels(&self) -> Vec<String> {
        self.channels.lock().await.iter().cloned().collect()
    }

    /// Tags `event` with this node's origin and sends it.
    pub async fn publish(&self, channel: &str, event: &SyncEvent) -> Result<(), BrokerError> {
        if self.is_shutting_down() {
            return Err(BrokerError::Closed);
        }
        let envelope = BrokerEnvelope {
            source_node: self.origin.clone(),
            event: event.clone(),
        };
        let payload = serde_json::to_string(&envelope)?;
        match self.publisher.publish(channel, payload).await {
            Ok(()) => {
                broker_metrics().published_total.inc();
                Ok(())
            }
            Err(err) => {
                broker_metrics().publish_failures_total.inc();
                Err(err)
            }
        }
    }

    /// Starts dispatching inbound messages to `handler`. Only one handler can
    /// be installed per bridge.
    pub async fn on_message(&self, handler: Arc<dyn BrokerHandler>) -> Result<(), BrokerError> {
        let mut inbound = self
            .subscriber
            .take_messages()
            .await
            .ok_or(BrokerError::Closed)?;
        let origin = self.origin.clone();

        let task = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let envelope: BrokerEnvelope = match serde_json::from_str(&message.payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(%err, channel = %message.channel, "broker: dropping undecodable envelope");
                        continue;
                    }
                };
                if is_echo(&envelope, &origin) {
                    broker_metrics().echo_suppressed_total.inc();
                    continue;
                }
                broker_metrics().received_total.inc();
                handler.handle(&message.channel, envelope.event).await;
            }
            debug!(node_id = %origin, "broker: inbound stream ended");
        });

        *self.dispatcher.lock().await = Some(task);
        Ok(())
    }

    /// Best-effort count of subscribers on `channel`; 0 on any failure.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        match self.publisher.subscriber_count(channel).await {
            Ok(count) => count,
            Err(err) => {
                debug!(%err, channel, "broker: subscriber count unavailable");
                0
            }
        }
    }

    pub async fn ping(&self) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        self.publisher.ping().await.is_ok()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Unsubscribes everything and closes both handles. Safe to call twice.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let tracked: Vec<String> = {
            let mut channels = self.channels.lock().await;
            std::mem::take(&mut *channels).into_iter().collect()
        };
        for channel in &tracked {
            let _ = self.subscriber.unsubscribe(channel).await;
        }
        broker_metrics().subscribed_channels.set(0);

        let _ = self.subscriber.close().await;
        let _ = self.publisher.close().await;

        if let Some(task) = self.dispatcher.lock().await.take() {
            task.abort();
        }
        info!(node_id = %self.origin, channels = tracked.len(), "broker: shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SyncEventType;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, SyncEvent)>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BrokerHandler for Recorder {
        async fn handle(&self, channel: &str, event: SyncEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().await.push((channel.to_string(), event));
        }
    }

    fn event(sender: &str) -> SyncEvent {
        SyncEvent::new(SyncEventType::ChatGlobal, json!({"content": "hi"}), sender, "eu-1", 1)
    }

    async fn bridge_on(hub: &memory::MemoryHub, node: &str) -> (Arc<BrokerBridge>, Arc<Recorder>) {
        let (publisher, subscriber) = hub.connect();
        let bridge = Arc::new(BrokerBridge::new(node, Arc::new(publisher), Arc::new(subscriber)));
        let recorder = Arc::new(Recorder::default());
        bridge.on_message(recorder.clone()).await.expect("handler");
        bridge.init().await.expect("init");
        (bridge, recorder)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn echo_guard_matches_only_local_origin() {
        let local = OriginTag::new("node-a");
        let mine = BrokerEnvelope { source_node: OriginTag::new("node-a"), event: event("p") };
        let theirs = BrokerEnvelope { source_node: OriginTag::new("node-b"), event: event("p") };
        assert!(is_echo(&mine, &local));
        assert!(!is_echo(&theirs, &local));
    }

    #[test]
    fn envelope_wire_shape() {
        let envelope = BrokerEnvelope { source_node: OriginTag::new("node-a"), event: event("p") };
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["sourceNode"], "node-a");
        assert_eq!(value["event"]["type"], "CHAT_GLOBAL");
    }

    #[tokio::test]
    async fn own_publications_never_reach_local_handler() {
        let hub = memory::MemoryHub::default();
        let (node_a, seen_a) = bridge_on(&hub, "node-a").await;
        let (_node_b, seen_b) = bridge_on(&hub, "node-b").await;

        node_a.publish(channels::GLOBAL, &event("alice")).await.expect("publish");
        settle().await;

        assert_eq!(seen_a.calls.load(Ordering::SeqCst), 0);
        assert_eq!(seen_b.calls.load(Ordering::SeqCst), 1);
        let seen = seen_b.seen.lock().await;
        assert_eq!(seen[0].0, channels::GLOBAL);
        assert_eq!(seen[0].1.sender_id, "alice");
    }

    #[tokio::test]
    async fn lazy_channels_only_deliver_after_subscribe() {
        let hub = memory::MemoryHub::default();
        let (node_a, _) = bridge_on(&hub, "node-a").await;
        let (node_b, seen_b) = bridge_on(&hub, "node-b").await;
        let raid = channels::raid("r1");

        node_a.publish(&raid, &event("alice")).await.expect("publish");
        settle().await;
        assert_eq!(seen_b.calls.load(Ordering::SeqCst), 0);

        node_b.ensure_subscribed(&raid).await;
        assert!(node_b.is_subscribed(&raid).await);
        node_a.publish(&raid, &event("alice")).await.expect("publish");
        settle().await;
        assert_eq!(seen_b.calls.load(Ordering::SeqCst), 1);

        node_b.release(&raid).await;
        assert!(!node_b.is_subscribed(&raid).await);
        node_a.publish(&raid, &event("alice")).await.expect("publish");
        settle().await;
        assert_eq!(seen_b.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delivery_preserves_publish_order() {
        let hub = memory::MemoryHub::default();
        let (node_a, _) = bridge_on(&hub, "node-a").await;
        let (_node_b, seen_b) = bridge_on(&hub, "node-b").await;

        for i in 0..20 {
            let mut e = event("alice");
            e.timestamp = i;
            node_a.publish(channels::GLOBAL, &e).await.expect("publish");
        }
        settle().await;

        let seen = seen_b.seen.lock().await;
        let stamps: Vec<i64> = seen.iter().map(|(_, e)| e.timestamp).collect();
        assert_eq!(stamps, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn introspection_and_shutdown() {
        let hub = memory::MemoryHub::default();
        let (node_a, _) = bridge_on(&hub, "node-a").await;
        let (node_b, _) = bridge_on(&hub, "node-b").await;

        assert_eq!(node_a.subscriber_count(channels::GLOBAL).await, 2);
        assert_eq!(node_a.subscriber_count("nobody-here").await, 0);
        assert!(node_a.ping().await);

        node_b.shutdown().await;
        node_b.shutdown().await;
        assert!(node_b.subscribed_channels().await.is_empty());
        assert!(!node_b.ping().await);
        assert!(matches!(
            node_b.publish(channels::GLOBAL, &event("bob")).await,
            Err(BrokerError::Closed)
        ));
        assert_eq!(node_a.subscriber_count(channels::GLOBAL).await, 1);
    }
}
