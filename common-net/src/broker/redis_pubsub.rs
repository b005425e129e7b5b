//! Redis pub/sub backend.
//!
//! Publishing goes through a [`ConnectionManager`] (reconnects on its own).
//! Subscribing needs a connection in subscriber mode, which accepts nothing
//! but (un)subscribe commands, so a dedicated task owns the [`PubSub`]
//! connection and takes (un)subscribe requests over a command channel while
//! forwarding every message it reads. When that connection drops, the task
//! reconnects with backoff and replays every channel it had subscribed.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::AsyncCommands;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use super::{BrokerError, BrokerPublisher, BrokerSubscriber, InboundMessage};
use crate::metrics::broker_metrics;

const RECONNECT_MIN: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

pub async fn connect(url: &str) -> Result<(RedisPublisher, RedisSubscriber), BrokerError> {
    let client = redis::Client::open(url)?;
    let manager = ConnectionManager::new(client.clone()).await?;
    let pubsub = client.get_async_pubsub().await?;

    let (messages_tx, messages_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_subscriber(client, pubsub, commands_rx, messages_tx));

    Ok((
        RedisPublisher {
            conn: Mutex::new(Some(manager)),
        },
        RedisSubscriber {
            commands: commands_tx,
            messages: Mutex::new(Some(messages_rx)),
        },
    ))
}

pub struct RedisPublisher {
    conn: Mutex<Option<ConnectionManager>>,
}

impl RedisPublisher {
    async fn connection(&self) -> Result<ConnectionManager, BrokerError> {
        self.conn.lock().await.clone().ok_or(BrokerError::Closed)
    }
}

#[async_trait]
impl BrokerPublisher for RedisPublisher {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        let _receivers: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscriber_count(&self, channel: &str) -> Result<usize, BrokerError> {
        let mut conn = self.connection().await?;
        let (_name, count): (String, usize) = redis::cmd("PUBSUB")
            .arg("NUMSUB")
            .arg(channel)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.conn.lock().await.take();
        Ok(())
    }
}

enum SubscriberCommand {
    Subscribe(String, oneshot::Sender<Result<(), BrokerError>>),
    Unsubscribe(String, oneshot::Sender<Result<(), BrokerError>>),
    Close,
}

pub struct RedisSubscriber {
    commands: mpsc::UnboundedSender<SubscriberCommand>,
    messages: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
}

impl RedisSubscriber {
    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), BrokerError>>) -> SubscriberCommand,
    ) -> Result<(), BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| BrokerError::Closed)?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }
}

#[async_trait]
impl BrokerSubscriber for RedisSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        let channel = channel.to_string();
        self.request(|tx| SubscriberCommand::Subscribe(channel, tx)).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        let channel = channel.to_string();
        self.request(|tx| SubscriberCommand::Unsubscribe(channel, tx)).await
    }

    async fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        self.messages.lock().await.take()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let _ = self.commands.send(SubscriberCommand::Close);
        Ok(())
    }
}

enum Pumped {
    Command(Option<SubscriberCommand>),
    Disconnected,
    ConsumerGone,
}

async fn run_subscriber(
    client: redis::Client,
    mut pubsub: PubSub,
    mut commands: mpsc::UnboundedReceiver<SubscriberCommand>,
    messages: mpsc::UnboundedSender<InboundMessage>,
) {
    let mut channels = BTreeSet::new();
    loop {
        match pump(&mut pubsub, &mut commands, &messages).await {
            Pumped::Command(Some(SubscriberCommand::Subscribe(channel, reply))) => {
                let result = pubsub.subscribe(&channel).await.map_err(BrokerError::from);
                if result.is_ok() {
                    channels.insert(channel);
                }
                let _ = reply.send(result);
            }
            Pumped::Command(Some(SubscriberCommand::Unsubscribe(channel, reply))) => {
                channels.remove(&channel);
                let result = pubsub.unsubscribe(&channel).await.map_err(BrokerError::from);
                let _ = reply.send(result);
            }
            Pumped::Command(Some(SubscriberCommand::Close) | None) => {
                debug!("broker: redis subscriber closing");
                return;
            }
            Pumped::ConsumerGone => {
                debug!("broker: inbound consumer gone, stopping subscriber");
                return;
            }
            Pumped::Disconnected => {
                broker_metrics().subscriber_disconnects_total.inc();
                warn!(channels = channels.len(), "broker: redis subscriber connection lost, reconnecting");
                match reconnect(&client, &mut commands, &mut channels).await {
                    Some(fresh) => pubsub = fresh,
                    None => return,
                }
            }
        }
    }
}

/// Forwards messages until a command arrives or the connection ends. The
/// message stream borrows the connection, so it lives only this long.
async fn pump(
    pubsub: &mut PubSub,
    commands: &mut mpsc::UnboundedReceiver<SubscriberCommand>,
    messages: &mpsc::UnboundedSender<InboundMessage>,
) -> Pumped {
    let stream = pubsub.on_message();
    tokio::pin!(stream);
    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return Pumped::Disconnected;
                };
                let channel = msg.get_channel_name().to_string();
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if messages.send(InboundMessage { channel, payload }).is_err() {
                            return Pumped::ConsumerGone;
                        }
                    }
                    Err(err) => warn!(%err, channel = %channel, "broker: non-text payload dropped"),
                }
            }
            command = commands.recv() => return Pumped::Command(command),
        }
    }
}

fn next_delay(delay: Duration) -> Duration {
    (delay * 2).min(RECONNECT_MAX)
}

/// Opens a new subscriber connection and replays `channels` on it, backing
/// off between attempts. Requests that arrive meanwhile only edit
/// `channels`. Returns `None` once the bridge closes.
async fn reconnect(
    client: &redis::Client,
    commands: &mut mpsc::UnboundedReceiver<SubscriberCommand>,
    channels: &mut BTreeSet<String>,
) -> Option<PubSub> {
    let mut delay = RECONNECT_MIN;
    loop {
        let pause = tokio::time::sleep(delay);
        tokio::pin!(pause);
        loop {
            tokio::select! {
                _ = &mut pause => break,
                command = commands.recv() => match command {
                    Some(SubscriberCommand::Subscribe(channel, reply)) => {
                        channels.insert(channel);
                        let _ = reply.send(Ok(()));
                    }
                    Some(SubscriberCommand::Unsubscribe(channel, reply)) => {
                        channels.remove(&channel);
                        let _ = reply.send(Ok(()));
                    }
                    Some(SubscriberCommand::Close) | None => return None,
                },
            }
        }

        match resubscribe(client, channels).await {
            Ok(pubsub) => {
                info!(channels = channels.len(), "broker: redis subscriber reconnected");
                return Some(pubsub);
            }
            Err(err) => {
                delay = next_delay(delay);
                warn!(%err, retry_in_ms = delay.as_millis() as u64, "broker: redis subscriber reconnect failed");
            }
        }
    }
}

async fn resubscribe(client: &redis::Client, channels: &BTreeSet<String>) -> Result<PubSub, redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    for channel in channels {
        pubsub.subscribe(channel).await?;
    }
    Ok(pubsub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_backoff_doubles_up_to_cap() {
        let mut delay = RECONNECT_MIN;
        let mut seen = Vec::new();
        for _ in 0..10 {
            delay = next_delay(delay);
            seen.push(delay);
        }
        assert_eq!(seen[0], Duration::from_millis(500));
        assert_eq!(seen[1], Duration::from_secs(1));
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*seen.last().expect("delays"), RECONNECT_MAX);
    }

    #[tokio::test]
    async fn requests_during_an_outage_edit_the_replay_set() {
        let client = redis::Client::open("redis://127.0.0.1:1/").expect("client");
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
        let mut channels = BTreeSet::from(["shard:eu-1".to_string(), "raid:r1".to_string()]);

        let (sub_tx, sub_rx) = oneshot::channel();
        let (unsub_tx, unsub_rx) = oneshot::channel();
        commands_tx
            .send(SubscriberCommand::Subscribe("corp:c1".into(), sub_tx))
            .expect("send");
        commands_tx
            .send(SubscriberCommand::Unsubscribe("raid:r1".into(), unsub_tx))
            .expect("send");
        commands_tx.send(SubscriberCommand::Close).expect("send");

        let outcome = reconnect(&client, &mut commands_rx, &mut channels).await;

        assert!(outcome.is_none());
        assert!(matches!(sub_rx.await, Ok(Ok(()))));
        assert!(matches!(unsub_rx.await, Ok(Ok(()))));
        let replay: Vec<&str> = channels.iter().map(String::as_str).collect();
        assert_eq!(replay, vec!["corp:c1", "shard:eu-1"]);
    }
}
