use std::sync::Arc;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::Response,
};
use futures_util::StreamExt;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::{
    bridge,
    gate::{Principal, RequireUpgradeToken},
    relay,
    state::AppState,
};

pub async fn container_logs(
    RequireUpgradeToken(principal): RequireUpgradeToken,
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let span = session_span("logs", &container_id, &principal);
    ws.on_upgrade(move |socket| {
        async move {
            let (tx, rx) = socket.split();
            relay::stream_logs(state.logs.as_ref(), &container_id, tx, rx).await;
        }
        .instrument(span)
    })
}

pub async fn container_exec(
    RequireUpgradeToken(principal): RequireUpgradeToken,
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let span = session_span("exec", &container_id, &principal);
    ws.on_upgrade(move |socket| {
        async move {
            let (tx, rx) = socket.split();
            bridge::run_shell(Arc::clone(&state.shells), &container_id, tx, rx).await;
        }
        .instrument(span)
    })
}

fn session_span(kind: &'static str, container_id: &str, principal: &Principal) -> tracing::Span {
    let connection_id = Uuid::new_v4();
    let subject = principal.subject().unwrap_or("anonymous");
    info!(%connection_id, container_id, kind, subject, "upgrade accepted");
    info_span!("session", %connection_id, container_id, kind)
}
