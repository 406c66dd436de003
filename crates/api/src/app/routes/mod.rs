use axum::{Router, routing::get};

pub mod jobs;
pub mod system;

/// Router for all compilation endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .merge(jobs::router())
}
