//! HTTP API for the monitor.
//!
//! Provides:
//! - `/health` - controller liveness
//! - `/status` - current recovery state snapshot
//! - `/metrics` - Prometheus metrics export

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use recovery_common::RecoveryStateRecord;
use serde_json::json;
use tokio::sync::watch;

use crate::metrics;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    /// Latest persisted recovery state.
    pub status: watch::Receiver<RecoveryStateRecord>,
    pub version: &'static str,
    pub started_at: Instant,
    pub pid: u32,
}

pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(Arc::new(state))
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

/// Always 200 while the process is serving requests.
async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(json!({
        "status": "running",
        "version": state.version,
        "pid": state.pid,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn status_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let snapshot = state.status.borrow().clone();
    Json(snapshot)
}

/// Bind `port` on all interfaces and serve until `shutdown` turns true.
pub async fn start_server(
    port: u16,
    state: HttpState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<tokio::task::JoinHandle<std::io::Result<()>>> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Serving status and metrics on port {}", port);

    Ok(tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
    }))
}
