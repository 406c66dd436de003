//! Job lifecycle state machine.
//!
//! ```text
//! Pending ──▶ Processing ──▶ Completed
//!    │             └───────▶ Failed
//!    └── cancel ───────────▶ Failed
//! ```
//!
//! Each state carries exactly the fields that are valid for it. A transition
//! builds a fresh value from the previous one; nothing is patched in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Error recorded when a pending job is withdrawn before any worker claims it.
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Status discriminant, as reported to pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result summary attached to a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<String>,
    pub duration_ms: u64,
}

/// Persisted status record of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Pending {
        created_at: DateTime<Utc>,
    },
    Processing {
        created_at: DateTime<Utc>,
        processing_started_at: DateTime<Utc>,
    },
    Completed {
        created_at: DateTime<Utc>,
        processing_started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warnings: Option<String>,
    },
    Failed {
        created_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        processing_started_at: Option<DateTime<Utc>>,
        completed_at: DateTime<Utc>,
        error: String,
        duration_ms: u64,
    },
}

impl JobState {
    /// Initial record written by the enqueuer.
    pub fn pending(created_at: DateTime<Utc>) -> Self {
        Self::Pending { created_at }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Pending { .. } => JobStatus::Pending,
            JobState::Processing { .. } => JobStatus::Processing,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            JobState::Pending { created_at }
            | JobState::Processing { created_at, .. }
            | JobState::Completed { created_at, .. }
            | JobState::Failed { created_at, .. } => *created_at,
        }
    }

    pub fn processing_started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Pending { .. } => None,
            JobState::Processing {
                processing_started_at,
                ..
            }
            | JobState::Completed {
                processing_started_at,
                ..
            } => Some(*processing_started_at),
            JobState::Failed {
                processing_started_at,
                ..
            } => *processing_started_at,
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Completed { completed_at, .. } | JobState::Failed { completed_at, .. } => {
                Some(*completed_at)
            }
            _ => None,
        }
    }

    /// Result summary; only terminal states have one.
    pub fn outcome(&self) -> Option<JobOutcome> {
        match self {
            JobState::Completed {
                duration_ms,
                warnings,
                ..
            } => Some(JobOutcome {
                success: true,
                error: None,
                warnings: warnings.clone(),
                duration_ms: *duration_ms,
            }),
            JobState::Failed {
                error, duration_ms, ..
            } => Some(JobOutcome {
                success: false,
                error: Some(error.clone()),
                warnings: None,
                duration_ms: *duration_ms,
            }),
            _ => None,
        }
    }

    /// Pending → Processing (a worker claimed the job).
    pub fn start_processing(&self, now: DateTime<Utc>) -> DomainResult<Self> {
        match self {
            JobState::Pending { created_at } => Ok(JobState::Processing {
                created_at: *created_at,
                processing_started_at: now,
            }),
            other => Err(DomainError::illegal_transition(other.status(), JobStatus::Processing)),
        }
    }

    /// Processing → Completed.
    pub fn complete(
        &self,
        now: DateTime<Utc>,
        duration_ms: u64,
        warnings: Option<String>,
    ) -> DomainResult<Self> {
        match self {
            JobState::Processing {
                created_at,
                processing_started_at,
            } => Ok(JobState::Completed {
                created_at: *created_at,
                processing_started_at: *processing_started_at,
                completed_at: now,
                duration_ms,
                warnings,
            }),
            other => Err(DomainError::illegal_transition(other.status(), JobStatus::Completed)),
        }
    }

    /// Processing → Failed.
    pub fn fail(
        &self,
        now: DateTime<Utc>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> DomainResult<Self> {
        match self {
            JobState::Processing {
                created_at,
                processing_started_at,
            } => Ok(JobState::Failed {
                created_at: *created_at,
                processing_started_at: Some(*processing_started_at),
                completed_at: now,
                error: error.into(),
                duration_ms,
            }),
            other => Err(DomainError::illegal_transition(other.status(), JobStatus::Failed)),
        }
    }

    /// Pending → Failed, only for a job withdrawn before any worker claimed it.
    pub fn cancel(&self, now: DateTime<Utc>) -> DomainResult<Self> {
        match self {
            JobState::Pending { created_at } => Ok(Self::cancelled(*created_at, now)),
            other => Err(DomainError::illegal_transition(other.status(), JobStatus::Failed)),
        }
    }

    /// Cancellation record for a job whose pending record is no longer readable.
    pub fn cancelled(created_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        JobState::Failed {
            created_at,
            processing_started_at: None,
            completed_at: now,
            error: CANCELLED_BY_USER.to_string(),
            duration_ms: 0,
        }
    }
}
