//! Realtime connection gateway: WebSocket sessions, local rooms, and the
//! broker relay that keeps every node's rooms in step.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use common_net::broker::{BrokerBridge, BrokerSettings};
use common_net::metrics::gateway_metrics;
use common_net::shutdown::{self, ShutdownReceiver};
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use replication::ReplicationService;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod archive;
pub mod error;
pub mod hub;
pub mod registry;
pub mod ws;

pub use archive::{ChatArchive, PrivateMessage};
pub use error::GatewayError;
pub use hub::{DisconnectReason, Gateway, GatewayOptions};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const HEALTHZ_PATH: &str = "/healthz";
pub const VERSION_PATH: &str = "/version";
pub const METRICS_PATH: &str = "/metrics";
pub const STATS_PATH: &str = "/stats";
pub const WS_PATH: &str = "/ws";

pub(crate) static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_http_requests_total",
        "HTTP requests served by route",
        &["path"]
    )
    .expect("register gateway_http_requests_total")
});

fn env_or<T>(key: &str, default: T) -> Result<T, BoxError>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|err| Box::new(err) as BoxError),
        _ => Ok(default),
    }
}

fn default_node_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("gateway-{}", &id[..8])
}

fn default_raid_close_delay_secs() -> u64 {
    30
}

fn default_shutdown_drain_ms() -> u64 {
    1000
}

fn default_idle_timeout_secs() -> u64 {
    90
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewaySettings {
    pub bind_addr: SocketAddr,
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default = "default_raid_close_delay_secs")]
    pub raid_close_delay_secs: u64,
    #[serde(default = "default_shutdown_drain_ms")]
    pub shutdown_drain_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl GatewaySettings {
    pub fn from_env() -> Result<Self, BoxError> {
        let bind_addr: SocketAddr = env_or("GATEWAY_BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?;
        let node_id = std::env::var("NODE_ID")
            .ok()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(default_node_id);
        Ok(Self {
            bind_addr,
            node_id,
            broker: BrokerSettings::from_env(),
            raid_close_delay_secs: env_or("RAID_CLOSE_DELAY_SECS", default_raid_close_delay_secs())?,
            shutdown_drain_ms: env_or("SHUTDOWN_DRAIN_MS", default_shutdown_drain_ms())?,
            idle_timeout_secs: env_or("IDLE_TIMEOUT_SECS", default_idle_timeout_secs())?,
        })
    }

    pub fn options(&self) -> GatewayOptions {
        GatewayOptions {
            raid_close_delay: Duration::from_secs(self.raid_close_delay_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(1)),
            shutdown_drain: Duration::from_millis(self.shutdown_drain_ms),
        }
    }
}

pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub node_id: String,
    pub broker: BrokerSettings,
    pub options: GatewayOptions,
    pub archive: Option<Arc<dyn ChatArchive>>,
    pub ready_tx: Option<oneshot::Sender<SocketAddr>>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("bind_addr", &self.bind_addr)
            .field("node_id", &self.node_id)
            .field("broker", &self.broker)
            .field("options", &self.options)
            .field("archive", &self.archive.is_some())
            .finish()
    }
}

impl GatewayConfig {
    pub fn from_settings(settings: GatewaySettings) -> Self {
        Self {
            options: settings.options(),
            bind_addr: settings.bind_addr,
            node_id: settings.node_id,
            broker: settings.broker,
            archive: None,
            ready_tx: None,
        }
    }
}

pub fn build_router(gateway: Gateway) -> Router {
    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(VERSION_PATH, get(version))
        .route(METRICS_PATH, get(metrics))
        .route(STATS_PATH, get(stats))
        .route(WS_PATH, get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

async fn healthz() -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[HEALTHZ_PATH]).inc();
    axum::http::StatusCode::OK
}

async fn version(State(gateway): State<Gateway>) -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[VERSION_PATH]).inc();
    Json(serde_json::json!({
        "name": "gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "node": gateway.node_id(),
    }))
}

async fn metrics() -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[METRICS_PATH]).inc();
    common_net::metrics::metrics_handler().await
}

async fn stats(State(gateway): State<Gateway>) -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[STATS_PATH]).inc();
    Json(gateway.get_stats().await)
}

/// Serves the gateway until `shutdown_rx` fires, then announces shutdown to
/// every client, closes their sockets and stops the broker bridge.
pub async fn run(
    config: GatewayConfig,
    replication: Arc<ReplicationService>,
    shutdown_rx: ShutdownReceiver,
) -> Result<(), BoxError> {
    gateway_metrics().on_startup();

    let broker = Arc::new(BrokerBridge::connect(&config.broker, &config.node_id).await?);
    let gateway = Gateway::new(Arc::clone(&broker), replication, config.options, config.archive);
    broker.on_message(Arc::new(gateway.clone())).await?;
    broker.init().await?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| Box::new(e) as BoxError)?;
    let local_addr = listener.local_addr().map_err(|e| Box::new(e) as BoxError)?;
    info!(%local_addr, node_id = %config.node_id, "gateway listening");
    if let Some(tx) = config.ready_tx {
        let _ = tx.send(local_addr);
    }

    let reaper = gateway.spawn_idle_reaper(shutdown_rx.clone());
    let app = build_router(gateway.clone());
    let closing = gateway.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown::wait(shutdown_rx).await;
            closing.close_connections().await;
        })
        .await
        .map_err(|e| Box::new(e) as BoxError)?;

    reaper.abort();
    broker.shutdown().await;
    info!(node_id = %config.node_id, "gateway stopped");
    Ok(())
}
