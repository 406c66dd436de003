//! The immutable compilation request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{DocumentRef, JobId, OwnerRef};

/// One compilation request.
///
/// Created once by the enqueuer and never mutated afterwards; the worker only
/// ever reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationJob {
    pub id: JobId,
    pub document_ref: DocumentRef,
    pub owner_ref: OwnerRef,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl CompilationJob {
    pub fn new(
        document_ref: DocumentRef,
        owner_ref: OwnerRef,
        source: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            document_ref,
            owner_ref,
            source: source.into(),
            created_at,
        }
    }

    /// Base filename handed to the compiler; derived from the document
    /// reference so logs and workspaces are recognisable.
    pub fn base_filename(&self) -> &str {
        self.document_ref.as_str()
    }
}
