use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

use common_net::telemetry;
use server::{BoxError, ServerConfig, ServerSettings};

#[derive(Debug, Parser)]
#[command(author, version, about = "Realtime sync node: gateway plus replication jobs")]
struct ServerCli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[arg(long, value_name = "ADDR")]
    gateway_bind: Option<SocketAddr>,

    /// Broker origin tag for this node.
    #[arg(long, value_name = "ID")]
    node_id: Option<String>,

    #[arg(long, value_name = "URL")]
    redis_url: Option<String>,

    #[arg(long, value_name = "URL")]
    pocketbase_url: Option<String>,

    #[arg(long, value_name = "SECS")]
    leaderboard_refresh_secs: Option<u64>,
}

impl ServerCli {
    fn resolve_config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            return Some(path.clone());
        }
        std::env::var("SERVER_CONFIG_PATH").ok().map(PathBuf::from)
    }

    fn apply_overrides(&self, settings: &mut ServerSettings) {
        if let Some(addr) = self.gateway_bind {
            settings.gateway.bind_addr = addr;
        }
        if let Some(node_id) = &self.node_id {
            settings.gateway.node_id = node_id.clone();
        }
        if let Some(url) = &self.redis_url {
            settings.gateway.broker.redis_url = Some(url.clone());
        }
        if let Some(url) = &self.pocketbase_url {
            settings.replication.pocketbase_url = Some(url.clone());
        }
        if let Some(secs) = self.leaderboard_refresh_secs {
            settings.replication.leaderboard_refresh_secs = secs;
        }
    }
}

fn build_config(cli: &ServerCli) -> Result<ServerConfig, BoxError> {
    let mut settings = if let Some(path) = cli.resolve_config_path() {
        ServerSettings::from_file(&path)?
    } else {
        ServerSettings::from_env()?
    };

    cli.apply_overrides(&mut settings);

    Ok(settings.into_config())
}

#[tokio::main]
async fn main() {
    telemetry::init("server");

    let cli = ServerCli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "server: invalid configuration");
            return;
        }
    };

    if let Err(err) = server::run_with_ctrl_c(config).await {
        tracing::error!(%err, "server exited with error");
    }
}
