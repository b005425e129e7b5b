use std::sync::Arc;

use common_net::{clock, shutdown};
use gateway::{BoxError, GatewayConfig, GatewaySettings};
use replication::{ReplicationService, ReplicationSettings};
use tracing::error;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    common_net::telemetry::init("gateway");

    let settings = GatewaySettings::from_env()?;
    let replication_settings = ReplicationSettings::from_env()?;
    let replication = Arc::new(ReplicationService::connect(&replication_settings, clock::system()).await?);

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let ctrl_c = shutdown::trigger_on_ctrl_c(shutdown_tx, "gateway");

    let result = gateway::run(GatewayConfig::from_settings(settings), replication, shutdown_rx).await;
    ctrl_c.abort();
    if let Err(err) = &result {
        error!(%err, "gateway exited with error");
    }
    result
}
