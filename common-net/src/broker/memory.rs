//! In-process stand-in for the shared broker.
//!
//! Every publisher/subscriber pair created from one [`MemoryHub`] sees the
//! same channel table, so several bridges in one process behave like nodes
//! sharing a real broker. Delivery goes through each subscriber's unbounded
//! queue and is consumed on the bridge's dispatcher task, never inline in
//! `publish`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::{BrokerError, BrokerPublisher, BrokerSubscriber, InboundMessage};

type SubscriberId = u64;
type ChannelTable = HashMap<String, HashMap<SubscriberId, mpsc::UnboundedSender<InboundMessage>>>;

#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    channels: Arc<RwLock<ChannelTable>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryHub {
    pub fn connect(&self) -> (MemoryPublisher, MemorySubscriber) {
        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = MemoryPublisher {
            hub: self.clone(),
            closed: AtomicBool::new(false),
        };
        let subscriber = MemorySubscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            hub: self.clone(),
            tx,
            rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        };
        (publisher, subscriber)
    }
}

#[derive(Debug)]
pub struct MemoryPublisher {
    hub: MemoryHub,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerPublisher for MemoryPublisher {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let table = self.hub.channels.read().await;
        if let Some(subscribers) = table.get(channel) {
            for sender in subscribers.values() {
                // a closed receiver just means that node went away
                let _ = sender.send(InboundMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    async fn subscriber_count(&self, channel: &str) -> Result<usize, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let table = self.hub.channels.read().await;
        Ok(table.get(channel).map(HashMap::len).unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemorySubscriber {
    id: SubscriberId,
    hub: MemoryHub,
    tx: mpsc::UnboundedSender<InboundMessage>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerSubscriber for MemorySubscriber {
    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let mut table = self.hub.channels.write().await;
        table
            .entry(channel.to_string())
            .or_default()
            .insert(self.id, self.tx.clone());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        let mut table = self.hub.channels.write().await;
        if let Some(subscribers) = table.get_mut(channel) {
            subscribers.remove(&self.id);
            if subscribers.is_empty() {
                table.remove(channel);
            }
        }
        Ok(())
    }

    async fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        self.rx.lock().await.take()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut table = self.hub.channels.write().await;
        table.retain(|_, subscribers| {
            subscribers.remove(&self.id);
            !subscribers.is_empty()
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_fans_out_to_channel_subscribers_only() {
        let hub = MemoryHub::default();
        let (publisher, _) = hub.connect();
        let (_, sub_a) = hub.connect();
        let (_, sub_b) = hub.connect();
        let mut rx_a = sub_a.take_messages().await.expect("rx a");
        let mut rx_b = sub_b.take_messages().await.expect("rx b");
        assert!(sub_a.take_messages().await.is_none());

        sub_a.subscribe("global").await.expect("sub");
        sub_b.subscribe("shard:eu-1").await.expect("sub");

        publisher.publish("global", "payload".into()).await.expect("publish");

        let msg = rx_a.recv().await.expect("delivered");
        assert_eq!(msg.channel, "global");
        assert_eq!(msg.payload, "payload");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_removes_subscriber_everywhere() {
        let hub = MemoryHub::default();
        let (publisher, subscriber) = hub.connect();
        subscriber.subscribe("a").await.expect("sub");
        subscriber.subscribe("b").await.expect("sub");
        assert_eq!(publisher.subscriber_count("a").await.expect("count"), 1);

        subscriber.close().await.expect("close");
        assert_eq!(publisher.subscriber_count("a").await.expect("count"), 0);
        assert_eq!(publisher.subscriber_count("b").await.expect("count"), 0);
        assert!(matches!(subscriber.subscribe("c").await, Err(BrokerError::Closed)));
    }
}
