//! Single-process deployment: the gateway and the replication job scheduler
//! sharing one replication service, under one shutdown signal.

use std::{fs, future::Future, path::Path, pin::Pin, sync::Arc};

use common_net::{clock, shutdown};
use gateway::{GatewayConfig, GatewaySettings};
use replication::{jobs, ReplicationService, ReplicationSettings};
use tokio::task::JoinSet;
use tracing::{error, info};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ServerSettings {
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub replication: ReplicationSettings,
}

impl ServerSettings {
    pub fn from_env() -> Result<Self, BoxError> {
        Ok(Self {
            gateway: GatewaySettings::from_env()?,
            replication: ReplicationSettings::from_env()?,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, BoxError> {
        let raw = fs::read_to_string(path).map_err(|err| Box::new(err) as BoxError)?;
        let settings = serde_json::from_str(&raw).map_err(|err| Box::new(err) as BoxError)?;
        Ok(settings)
    }

    pub fn into_config(self) -> ServerConfig {
        ServerConfig::from_settings(self)
    }
}

#[derive(Debug)]
pub struct ServerConfig {
    pub gateway: GatewayConfig,
    pub replication: ReplicationSettings,
}

impl ServerConfig {
    pub fn from_settings(settings: ServerSettings) -> Self {
        Self {
            gateway: GatewayConfig::from_settings(settings.gateway),
            replication: settings.replication,
        }
    }

    pub fn from_env() -> Result<Self, BoxError> {
        ServerSettings::from_env().map(Self::from_settings)
    }
}

pub async fn run() -> Result<(), BoxError> {
    let config = ServerConfig::from_env()?;
    run_with_ctrl_c(config).await
}

pub async fn run_with_ctrl_c(config: ServerConfig) -> Result<(), BoxError> {
    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let ctrl_c = shutdown::trigger_on_ctrl_c(shutdown_tx, "server");

    let result = run_with_shutdown(config, shutdown_rx).await;

    ctrl_c.abort();
    result
}

pub async fn run_with_shutdown(
    config: ServerConfig,
    shutdown_rx: shutdown::ShutdownReceiver,
) -> Result<(), BoxError> {
    let (service_shutdown_tx, service_shutdown_rx) = shutdown::channel();

    let ServerConfig {
        gateway,
        replication,
    } = config;

    let service = Arc::new(ReplicationService::connect(&replication, clock::system()).await?);
    info!(?service, "server: replication service ready");

    let mut join_set: JoinSet<Result<(), BoxError>> = JoinSet::new();

    let gateway_shutdown = service_shutdown_rx.clone();
    let gateway_service = Arc::clone(&service);
    join_set.spawn(async move { gateway::run(gateway, gateway_service, gateway_shutdown).await });

    let jobs_shutdown = service_shutdown_rx;
    let job_settings = replication.jobs.clone();
    join_set.spawn(async move { jobs::run(service, job_settings, jobs_shutdown).await });

    let mut shutdown_future: Pin<Box<dyn Future<Output = ()> + Send>> =
        Box::pin(shutdown::wait(shutdown_rx));
    let mut service_error: Option<BoxError> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown_future => {
                info!("server: external shutdown requested");
                shutdown::trigger(&service_shutdown_tx);
                break;
            }
            maybe_task = join_set.join_next() => {
                match maybe_task {
                    Some(Ok(Ok(()))) => continue,
                    Some(Ok(Err(err))) => {
                        error!(%err, "server: service exited with error");
                        service_error = Some(err);
                        shutdown::trigger(&service_shutdown_tx);
                        break;
                    }
                    Some(Err(join_err)) => {
                        let err: BoxError = Box::new(join_err);
                        error!(%err, "server: service task panicked");
                        service_error = Some(err);
                        shutdown::trigger(&service_shutdown_tx);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    shutdown::trigger(&service_shutdown_tx);

    let drain_result = drain_join_set(&mut join_set).await;

    if let Some(err) = service_error {
        return Err(err);
    }

    drain_result
}

async fn drain_join_set(join_set: &mut JoinSet<Result<(), BoxError>>) -> Result<(), BoxError> {
    let mut first_err: Option<BoxError> = None;

    while let Some(task) = join_set.join_next().await {
        match task {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
            Err(join_err) => {
                if first_err.is_none() {
                    first_err = Some(Box::new(join_err) as BoxError);
                }
            }
        }
    }

    if let Some(err) = first_err {
        return Err(err);
    }

    Ok(())
}
