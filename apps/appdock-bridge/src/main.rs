use std::sync::Arc;

use anyhow::{Context, Result};
use appdock_bridge::{
    config::{Cli, ServerConfig},
    docker::DockerRuntime,
    serve,
    state::AppState,
    telemetry::Telemetry,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        auth_enabled = config.auth.enabled,
        log_tail = %config.docker.log_tail,
        exec_shell = %config.docker.exec_shell,
        "starting appdock-bridge"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    if !config.auth.enabled {
        warn!("authentication is disabled; every request is treated as authorized");
    } else if config.auth.uses_default_password() || config.auth.uses_default_secret() {
        warn!("default credentials or signing secret in use; set APPDOCK_PASSWORD and APPDOCK_JWT_SECRET");
    }

    let runtime = Arc::new(
        DockerRuntime::connect(config.docker.clone()).context("failed to create docker client")?,
    );
    let state = AppState::new(Arc::new(config.auth.clone()), runtime.clone(), runtime)
        .with_metrics(metrics);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("appdock-bridge listening on {}", config.listen_addr);

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
