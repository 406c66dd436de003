use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use texforge_infra::QueueError;

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    tracing::error!(error = %err, "queue operation failed");
    match err {
        QueueError::Store(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
        QueueError::Domain(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "invalid_job_state", e.to_string())
        }
    }
}

pub fn not_found() -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", "Job not found")
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
