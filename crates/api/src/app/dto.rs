use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use texforge_core::{JobId, JobOutcome, JobState, JobStatus};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CompileRequest {
    pub owner_ref: String,
    pub document_ref: String,
    pub source: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct EnqueuedResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutcome>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobStatusResponse {
    pub fn from_state(job_id: JobId, state: &JobState) -> Self {
        Self {
            job_id,
            status: state.status(),
            result: state.outcome(),
            created_at: state.created_at(),
            processing_started_at: state.processing_started_at(),
            completed_at: state.completed_at(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RateLimitedResponse {
    pub error: &'static str,
    pub message: String,
    pub retry_after: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
