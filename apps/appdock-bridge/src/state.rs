use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::{
    config::AuthSettings,
    provider::{LogSource, ShellProvider},
    token::TokenAuthority,
};

/// Shared by every handler; cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub tokens: Arc<TokenAuthority>,
    pub logs: Arc<dyn LogSource>,
    pub shells: Arc<dyn ShellProvider>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        auth: Arc<AuthSettings>,
        logs: Arc<dyn LogSource>,
        shells: Arc<dyn ShellProvider>,
    ) -> Self {
        Self {
            tokens: Arc::new(TokenAuthority::new(auth)),
            logs,
            shells,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}
