//! HTTP control surface: Prometheus exposition and hot reload.
//!
//! Served on `prometheusBind`. `GET /metrics` renders the recorder output
//! (404 when Prometheus is disabled); `POST|GET /reload` re-reads the
//! config directory and applies the diff, reporting the outcome in the
//! response body.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::{self, SERVER_CONFIG_DIR};
use crate::proxy::BackendManager;

#[derive(Clone)]
pub struct AdminState {
    pub manager: Arc<Mutex<BackendManager>>,
    pub config_dir: PathBuf,
    pub prometheus: Option<PrometheusHandle>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/reload", get(reload).post(reload))
        .with_state(state)
}

/// Serve the control surface until the process exits.
pub async fn serve(bind_addr: String, state: AdminState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    serve_on(listener, state).await
}

/// Serve on an already-bound listener; tests bind on port 0.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    state: AdminState,
) -> anyhow::Result<()> {
    info!(bind_addr = %listener.local_addr()?, "admin http listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn metrics(State(state): State<AdminState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

/// Re-read the per-backend config directory and reconcile. Reloads are
/// serialized by the manager mutex.
async fn reload(State(state): State<AdminState>) -> impl IntoResponse {
    let dir = state.config_dir.join(SERVER_CONFIG_DIR);
    let (configs, errors) = config::read_server_configs(&dir);
    for err in &errors {
        error!(error = %err, "config file skipped during reload");
    }

    let summary = state.manager.lock().await.load_all(configs).await;
    info!(%summary, "reload applied");

    let mut body = format!("reload applied: {summary}\n");
    for err in &errors {
        body.push_str(&format!("unreadable: {err}\n"));
    }
    (StatusCode::OK, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::RoutingTable;

    fn state_without_prometheus() -> AdminState {
        let table = Arc::new(RoutingTable::new());
        AdminState {
            manager: Arc::new(Mutex::new(BackendManager::new(table))),
            config_dir: PathBuf::from("/nonexistent"),
            prometheus: None,
        }
    }

    #[tokio::test]
    async fn metrics_is_404_when_prometheus_disabled() {
        let response = metrics(State(state_without_prometheus())).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reload_reports_summary_for_missing_dir() {
        let response = reload(State(state_without_prometheus())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
