use std::time::Duration;

use common_net::broker::BrokerSettings;
use common_net::{shutdown, telemetry};
use gateway::{GatewayConfig, GatewayOptions, HEALTHZ_PATH, STATS_PATH};
use replication::ReplicationSettings;
use reqwest::StatusCode;
use tokio::sync::oneshot;

#[tokio::test]
async fn orchestrator_runs_and_shuts_down_cleanly() -> Result<(), server::BoxError> {
    telemetry::init("server-test");

    let (gateway_ready_tx, gateway_ready_rx) = oneshot::channel();

    let gateway_config = GatewayConfig {
        bind_addr: "127.0.0.1:0"
            .parse()
            .map_err(|err| Box::new(err) as server::BoxError)?,
        node_id: "smoke".to_string(),
        broker: BrokerSettings::default(),
        options: GatewayOptions {
            shutdown_drain: Duration::from_millis(10),
            ..GatewayOptions::default()
        },
        archive: None,
        ready_tx: Some(gateway_ready_tx),
    };

    let config = server::ServerConfig {
        gateway: gateway_config,
        replication: ReplicationSettings::default(),
    };

    let (shutdown_tx, shutdown_rx) = shutdown::channel();

    let orchestrator = tokio::spawn(server::run_with_shutdown(config, shutdown_rx));

    let gateway_addr = gateway_ready_rx
        .await
        .map_err(|err| Box::new(err) as server::BoxError)?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .map_err(|err| Box::new(err) as server::BoxError)?;

    let resp = client
        .get(format!("http://{gateway_addr}{HEALTHZ_PATH}"))
        .send()
        .await
        .map_err(|err| Box::new(err) as server::BoxError)?;
    assert_eq!(StatusCode::OK, resp.status());

    let stats: serde_json::Value = client
        .get(format!("http://{gateway_addr}{STATS_PATH}"))
        .send()
        .await
        .map_err(|err| Box::new(err) as server::BoxError)?
        .json()
        .await
        .map_err(|err| Box::new(err) as server::BoxError)?;
    assert_eq!(stats["onlineCount"], 0);

    shutdown::trigger(&shutdown_tx);

    let orchestrator_result = orchestrator
        .await
        .map_err(|err| Box::new(err) as server::BoxError)?;
    orchestrator_result?;

    Ok(())
}

#[test]
fn settings_file_fills_defaults() -> Result<(), server::BoxError> {
    let path = std::env::temp_dir().join(format!("server-settings-{}.json", std::process::id()));
    std::fs::write(&path, r#"{ "gateway": { "bind_addr": "127.0.0.1:4100", "node_id": "n1" } }"#)
        .map_err(|err| Box::new(err) as server::BoxError)?;

    let settings = server::ServerSettings::from_file(&path)?;
    let _ = std::fs::remove_file(&path);

    assert_eq!(settings.gateway.node_id, "n1");
    assert_eq!(settings.gateway.raid_close_delay_secs, 30);
    assert!(settings.gateway.broker.redis_url.is_none());
    assert!(settings.replication.pocketbase_url.is_none());
    assert_eq!(settings.replication.leaderboard_refresh_secs, 60);
    assert_eq!(settings.replication.jobs.stale_session_minutes, 5);
    Ok(())
}
