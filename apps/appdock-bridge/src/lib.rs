//! WebSocket bridge between a browser and Docker containers: follows
//! container logs and attaches interactive shells behind a token gate.

pub mod bridge;
pub mod config;
pub mod demux;
pub mod docker;
pub mod gate;
pub mod protocol;
pub mod provider;
pub mod relay;
pub mod routes;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod token;

use std::future::Future;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::state::AppState;

/// Serves the router on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = routes::build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
}
