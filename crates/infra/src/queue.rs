//! Producer side of the compilation queue.
//!
//! [`CompilationQueue`] is the only entry point the surrounding layers use:
//! enqueue a compilation, poll its status, fetch its artifact, cancel it while
//! it is still waiting. The worker reuses the same type for record access so
//! both sides agree on keys, TTLs and encodings.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use texforge_core::{
    Clock, CompilationJob, DocumentRef, DomainError, JobId, JobState, JobStatus, OwnerRef,
    SystemClock,
};

use crate::store::{Batch, KeySpace, RecordStore, StoreError, decode_json, encode_json};

/// TTL applied to job payloads, status records and artifacts.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub keys: KeySpace,
    pub job_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            keys: KeySpace::default(),
            job_ttl: DEFAULT_JOB_TTL,
        }
    }
}

impl QueueConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.keys = KeySpace::new(namespace);
        self
    }

    pub fn with_job_ttl(mut self, ttl: Duration) -> Self {
        self.job_ttl = ttl;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Result of an artifact fetch that already took the job status into account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLookup {
    Ready(Vec<u8>),
    /// The job exists but has not completed (or failed).
    NotReady(JobStatus),
    /// Unknown job, or one whose records have expired.
    NotFound,
}

/// Point-in-time counters for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_depth: u64,
    pub processing_count: u64,
}

fn to_count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct CompilationQueue<S> {
    store: S,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl<S: RecordStore> CompilationQueue<S> {
    pub fn new(store: S, config: QueueConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn keys(&self) -> &KeySpace {
        &self.config.keys
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Persist the job, append it to the work queue and write its `Pending`
    /// status, all in one atomic batch. Never waits for a worker.
    pub async fn enqueue(
        &self,
        owner_ref: OwnerRef,
        document_ref: DocumentRef,
        source: impl Into<String>,
    ) -> Result<JobId, QueueError> {
        let now = self.clock.now();
        let job = CompilationJob::new(document_ref, owner_ref, source, now);
        let status = JobState::pending(now);
        let keys = self.keys();
        let ttl = self.config.job_ttl;

        let batch = Batch::new()
            .set_ex(keys.job(&job.id), encode_json(&job)?, ttl)
            .rpush(keys.queue(), job.id.to_string())
            .set_ex(keys.status(&job.id), encode_json(&status)?, ttl);
        self.store.execute(batch).await?;

        info!(
            job_id = %job.id,
            document = %job.document_ref,
            owner = %job.owner_ref,
            "compilation job enqueued"
        );
        Ok(job.id)
    }

    /// Current status record, or `None` for an unknown or expired job.
    pub async fn status(&self, job_id: &JobId) -> Result<Option<JobState>, QueueError> {
        match self.store.get(&self.keys().status(job_id)).await? {
            Some(bytes) => Ok(Some(decode_json(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Raw artifact bytes. Only meaningful once the status is `Completed`;
    /// prefer [`Self::fetch_artifact`] which checks that first.
    pub async fn artifact(&self, job_id: &JobId) -> Result<Option<Vec<u8>>, QueueError> {
        Ok(self.store.get(&self.keys().artifact(job_id)).await?)
    }

    /// Status-aware artifact fetch.
    ///
    /// A missing status record means the job is gone even if its artifact
    /// key has not expired yet.
    pub async fn fetch_artifact(&self, job_id: &JobId) -> Result<ArtifactLookup, QueueError> {
        let Some(state) = self.status(job_id).await? else {
            return Ok(ArtifactLookup::NotFound);
        };
        if state.status() != JobStatus::Completed {
            return Ok(ArtifactLookup::NotReady(state.status()));
        }
        match self.artifact(job_id).await? {
            Some(bytes) => Ok(ArtifactLookup::Ready(bytes)),
            None => Ok(ArtifactLookup::NotFound),
        }
    }

    /// Number of jobs waiting to be claimed.
    pub async fn depth(&self) -> Result<u64, QueueError> {
        Ok(to_count(self.store.llen(&self.keys().queue()).await?))
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let queue_depth = self.depth().await?;
        let processing_count = to_count(self.store.scard(&self.keys().processing()).await?);
        Ok(QueueStats {
            queue_depth,
            processing_count,
        })
    }

    /// Withdraw a job that no worker has claimed yet.
    ///
    /// Returns `false` when the id is not (or no longer) in the queue; in
    /// that case nothing is written.
    pub async fn cancel(&self, job_id: &JobId) -> Result<bool, QueueError> {
        let removed = self
            .store
            .lrem(&self.keys().queue(), &job_id.to_string())
            .await?;
        if removed == 0 {
            debug!(job_id = %job_id, "cancel ignored: job not queued");
            return Ok(false);
        }

        let now = self.clock.now();
        let cancelled = match self.status(job_id).await {
            Ok(Some(state)) => state.cancel(now).unwrap_or_else(|e| {
                warn!(job_id = %job_id, error = %e, "queued job had a non-pending status");
                JobState::cancelled(state.created_at(), now)
            }),
            Ok(None) => JobState::cancelled(now, now),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "unreadable status on cancel; overwriting");
                JobState::cancelled(now, now)
            }
        };
        self.write_status(job_id, &cancelled).await?;

        info!(job_id = %job_id, "compilation job cancelled");
        Ok(true)
    }

    /// Read the immutable job payload.
    pub async fn load_job(&self, job_id: &JobId) -> Result<Option<CompilationJob>, QueueError> {
        match self.store.get(&self.keys().job(job_id)).await? {
            Some(bytes) => Ok(Some(decode_json(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Overwrite the status record (refreshing its TTL).
    pub async fn write_status(&self, job_id: &JobId, state: &JobState) -> Result<(), QueueError> {
        self.store
            .set_ex(
                &self.keys().status(job_id),
                encode_json(state)?,
                self.config.job_ttl,
            )
            .await?;
        Ok(())
    }

    /// Store the artifact and the `Completed` status together, so a poller
    /// never sees `Completed` without a fetchable artifact.
    pub async fn write_completed(
        &self,
        job_id: &JobId,
        artifact: Vec<u8>,
        state: &JobState,
    ) -> Result<(), QueueError> {
        let keys = self.keys();
        let ttl = self.config.job_ttl;
        let batch = Batch::new()
            .set_ex(keys.artifact(job_id), artifact, ttl)
            .set_ex(keys.status(job_id), encode_json(state)?, ttl);
        self.store.execute(batch).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRecordStore;
    use texforge_core::ManualClock;

    const SOURCE: &str = "\\documentclass{article}\\begin{document}hi\\end{document}";

    fn queue() -> (CompilationQueue<Arc<InMemoryRecordStore>>, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryRecordStore::with_clock(Arc::new(clock.clone())));
        let queue = CompilationQueue::with_clock(store, QueueConfig::default(), Arc::new(clock.clone()));
        (queue, clock)
    }

    fn refs() -> (OwnerRef, DocumentRef) {
        (OwnerRef::new("user-1").unwrap(), DocumentRef::new("thesis").unwrap())
    }

    #[tokio::test]
    async fn enqueue_writes_pending_status_and_grows_queue() {
        let (queue, clock) = queue();
        let (owner, doc) = refs();

        assert_eq!(queue.depth().await.unwrap(), 0);
        let id = queue.enqueue(owner, doc, SOURCE).await.unwrap();

        let status = queue.status(&id).await.unwrap().unwrap();
        assert_eq!(status, JobState::pending(clock.now()));
        assert_eq!(queue.depth().await.unwrap(), 1);

        let job = queue.load_job(&id).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.source, SOURCE);
    }

    #[tokio::test]
    async fn cancel_pending_job_marks_it_failed() {
        let (queue, _clock) = queue();
        let (owner, doc) = refs();
        let id = queue.enqueue(owner, doc, SOURCE).await.unwrap();

        assert!(queue.cancel(&id).await.unwrap());
        assert_eq!(queue.depth().await.unwrap(), 0);

        let outcome = queue.status(&id).await.unwrap().unwrap().outcome().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("cancelled by user"));
        assert_eq!(outcome.duration_ms, 0);

        // Second cancel is a no-op.
        assert!(!queue.cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_unknown_job_changes_nothing() {
        let (queue, _clock) = queue();
        let unknown = JobId::new();
        assert!(!queue.cancel(&unknown).await.unwrap());
        assert!(queue.status(&unknown).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn artifact_requires_completed_status() {
        let (queue, clock) = queue();
        let (owner, doc) = refs();
        let id = queue.enqueue(owner, doc, SOURCE).await.unwrap();

        assert_eq!(
            queue.fetch_artifact(&id).await.unwrap(),
            ArtifactLookup::NotReady(JobStatus::Pending)
        );
        assert_eq!(
            queue.fetch_artifact(&JobId::new()).await.unwrap(),
            ArtifactLookup::NotFound
        );

        let now = clock.now();
        let completed = JobState::pending(now)
            .start_processing(now)
            .unwrap()
            .complete(now, 10, None)
            .unwrap();
        queue.write_completed(&id, b"%PDF".to_vec(), &completed).await.unwrap();

        assert_eq!(
            queue.fetch_artifact(&id).await.unwrap(),
            ArtifactLookup::Ready(b"%PDF".to_vec())
        );
    }

    #[tokio::test]
    async fn records_vanish_after_ttl() {
        let (queue, clock) = queue();
        let (owner, doc) = refs();
        let id = queue.enqueue(owner, doc, SOURCE).await.unwrap();

        clock.advance(chrono::Duration::hours(24));

        assert!(queue.status(&id).await.unwrap().is_none());
        assert!(queue.load_job(&id).await.unwrap().is_none());
        assert_eq!(queue.fetch_artifact(&id).await.unwrap(), ArtifactLookup::NotFound);
    }

    #[tokio::test]
    async fn completed_job_and_artifact_expire_together() {
        let (queue, clock) = queue();
        let (owner, doc) = refs();
        let id = queue.enqueue(owner, doc, SOURCE).await.unwrap();

        clock.advance(chrono::Duration::hours(1));
        let now = clock.now();
        let completed = JobState::pending(now)
            .start_processing(now)
            .unwrap()
            .complete(now, 10, None)
            .unwrap();
        queue.write_completed(&id, b"%PDF".to_vec(), &completed).await.unwrap();

        // Status and artifact TTLs run from completion.
        clock.advance(chrono::Duration::hours(23));
        assert_eq!(
            queue.fetch_artifact(&id).await.unwrap(),
            ArtifactLookup::Ready(b"%PDF".to_vec())
        );

        clock.advance(chrono::Duration::hours(1));
        assert!(queue.status(&id).await.unwrap().is_none());
        assert!(queue.artifact(&id).await.unwrap().is_none());
        assert_eq!(queue.fetch_artifact(&id).await.unwrap(), ArtifactLookup::NotFound);
    }
}
