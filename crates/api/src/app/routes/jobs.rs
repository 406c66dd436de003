use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};

use texforge_core::{Clock, DocumentRef, JobId, JobStatus, OwnerRef};
use texforge_infra::{ArtifactLookup, RateLimitDecision};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/compile", post(compile))
        .route("/jobs/:id", get(get_job).delete(cancel_job))
        .route("/jobs/:id/artifact", get(get_artifact))
}

fn rate_limit_headers(decision: &RateLimitDecision) -> [(&'static str, String); 2] {
    [
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.timestamp().to_string()),
    ]
}

/// Malformed ids are indistinguishable from unknown ones.
fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>().map_err(|_| errors::not_found())
}

pub async fn compile(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CompileRequest>,
) -> axum::response::Response {
    let owner = match OwnerRef::new(body.owner_ref) {
        Ok(o) => o,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
    };
    let document = match DocumentRef::new(body.document_ref) {
        Ok(d) => d,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
    };
    if body.source.trim().is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "LaTeX content is empty");
    }

    let decision = services
        .limiter
        .check_and_consume(document.as_str(), services.rate_limit)
        .await;
    let headers = rate_limit_headers(&decision);

    if !decision.allowed {
        let retry_after = decision.retry_after_secs(services.clock.now());
        tracing::info!(document = %document, retry_after, "compilation rejected by rate limit");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            headers,
            [(header::RETRY_AFTER, retry_after.to_string())],
            Json(dto::RateLimitedResponse {
                error: "rate_limited",
                message: decision.error.unwrap_or_default(),
                retry_after,
                reset_at: decision.reset_at,
            }),
        )
            .into_response();
    }

    match services.queue.enqueue(owner, document, body.source).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            headers,
            Json(dto::EnqueuedResponse {
                job_id,
                status: JobStatus::Pending,
            }),
        )
            .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.queue.status(&job_id).await {
        Ok(Some(state)) => Json(dto::JobStatusResponse::from_state(job_id, &state)).into_response(),
        Ok(None) => errors::not_found(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_artifact(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.queue.fetch_artifact(&job_id).await {
        Ok(ArtifactLookup::Ready(bytes)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/pdf".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"document-{job_id}.pdf\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Ok(ArtifactLookup::NotReady(status)) => errors::json_error(
            StatusCode::BAD_REQUEST,
            "not_ready",
            format!("PDF not ready (job is {status})"),
        ),
        Ok(ArtifactLookup::NotFound) => errors::not_found(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.queue.cancel(&job_id).await {
        Ok(true) => Json(serde_json::json!({
            "job_id": job_id,
            "cancelled": true,
        }))
        .into_response(),
        Ok(false) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            "Job not found or already being processed",
        ),
        Err(e) => errors::queue_error_to_response(e),
    }
}
