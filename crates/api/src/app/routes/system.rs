use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use crate::app::dto::HealthResponse;
use crate::app::services::AppServices;

/// Reports queue counters; `503` when the record store cannot be reached.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.queue.stats().await {
        Ok(stats) => Json(HealthResponse {
            status: "healthy",
            queue_depth: Some(stats.queue_depth),
            processing_count: Some(stats.processing_count),
            error: None,
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy",
                    queue_depth: None,
                    processing_count: None,
                    error: Some(e.to_string()),
                }),
            )
                .into_response()
        }
    }
}
