use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common_net::broker::BrokerSettings;
use common_net::shutdown;
use futures_util::{SinkExt, StreamExt};
use gateway::{GatewayConfig, GatewayOptions};
use replication::ReplicationService;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_tungstenite::{connect_async, tungstenite::Message};

async fn start() -> (SocketAddr, shutdown::ShutdownSender, tokio::task::JoinHandle<Result<(), gateway::BoxError>>) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let config = GatewayConfig {
        bind_addr: "127.0.0.1:0".parse().expect("addr"),
        node_id: "http-test".to_string(),
        broker: BrokerSettings::default(),
        options: GatewayOptions {
            shutdown_drain: Duration::from_millis(10),
            ..GatewayOptions::default()
        },
        archive: None,
        ready_tx: Some(ready_tx),
    };
    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let replication = Arc::new(ReplicationService::in_memory());
    let handle = tokio::spawn(gateway::run(config, replication, shutdown_rx));
    let addr = tokio::time::timeout(Duration::from_secs(5), ready_rx)
        .await
        .expect("gateway ready")
        .expect("ready address");
    (addr, shutdown_tx, handle)
}

async fn next_json<S>(stream: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("frame");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

#[tokio::test]
async fn http_endpoints_and_websocket_session() {
    let (addr, shutdown_tx, handle) = start().await;
    let http = reqwest::Client::new();

    let health = http
        .get(format!("http://{addr}/healthz"))
        .send()
        .await
        .expect("healthz");
    assert!(health.status().is_success());

    let version: Value = http
        .get(format!("http://{addr}/version"))
        .send()
        .await
        .expect("version")
        .json()
        .await
        .expect("version json");
    assert_eq!(version["name"], "gateway");
    assert_eq!(version["node"], "http-test");

    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.expect("ws connect");
    let (mut sink, mut stream) = ws.split();
    let auth = json!({ "event": "auth", "data": { "playerId": "alice", "shardId": "eu-1" } });
    sink.send(Message::Text(auth.to_string())).await.expect("send auth");

    let reply = next_json(&mut stream).await;
    assert_eq!(reply["event"], "auth:success");
    assert_eq!(reply["data"]["shardId"], "eu-1");
    assert_eq!(reply["data"]["onlineCount"], 1);

    let stats: Value = http
        .get(format!("http://{addr}/stats"))
        .send()
        .await
        .expect("stats")
        .json()
        .await
        .expect("stats json");
    assert_eq!(stats["onlineCount"], 1);
    assert_eq!(stats["shardCounts"]["eu-1"], 1);

    let metrics = http
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .expect("metrics")
        .text()
        .await
        .expect("metrics body");
    assert!(metrics.contains("gateway_http_requests_total"));

    shutdown::trigger(&shutdown_tx);
    let notice = next_json(&mut stream).await;
    assert_eq!(notice["event"], "error");
    assert_eq!(notice["data"]["code"], "SERVER_SHUTDOWN");

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("gateway stopped")
        .expect("join");
    assert!(result.is_ok());
}
