//! Worker process support: health endpoint and signal handling.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;

use texforge_infra::{CompilationWorker, RecordStore, Sandbox, WorkerStats};

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    running: bool,
    #[serde(flatten)]
    stats: Option<WorkerStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// `GET /health` for a worker: runtime counters plus queue depth.
pub fn health_router<S, X>(worker: Arc<CompilationWorker<S, X>>) -> Router
where
    S: RecordStore + 'static,
    X: Sandbox + 'static,
{
    Router::new()
        .route("/health", get(health::<S, X>))
        .layer(Extension(worker))
}

async fn health<S, X>(Extension(worker): Extension<Arc<CompilationWorker<S, X>>>) -> Response
where
    S: RecordStore + 'static,
    X: Sandbox + 'static,
{
    let running = worker.is_running();
    match worker.stats().await {
        Ok(stats) => Json(HealthResponse {
            status: "healthy",
            running,
            stats: Some(stats),
            error: None,
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "worker health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy",
                    running,
                    stats: None,
                    error: Some(e.to_string()),
                }),
            )
                .into_response()
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
