//! Compilation worker: claims queued jobs one at a time and drives each
//! through the sandbox.
//!
//! Lifecycle:
//! 1. [`CompilationWorker::start`] runs the crash-recovery sweep, then spawns
//!    the loop on the tokio runtime and returns a [`WorkerHandle`].
//! 2. The loop blocks on the queue for at most `pop_timeout`, so a stop
//!    request is observed within that bound.
//! 3. Each claimed job runs on its own task; an error or panic inside it is
//!    turned into a `Failed` status and the loop keeps going.
//!
//! The processing set marks jobs a worker has claimed but not finished. A
//! marker whose `Processing` status is older than `processing_timeout` at
//! startup belongs to a crashed worker and is failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use texforge_core::{Clock, DomainError, JobId, JobState};

use crate::queue::{CompilationQueue, QueueError};
use crate::sandbox::{CompileOptions, CompileOutput, CompileRequest, Sandbox};
use crate::store::{RecordStore, StoreError};

pub const JOB_DATA_NOT_FOUND: &str = "job data not found";
pub const JOB_TIMED_OUT: &str = "job timed out or worker crashed";

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Bounded wait of each blocking pop
    pub pop_timeout: Duration,
    /// Back-off after a failed pop
    pub poll_interval: Duration,
    /// Age after which a `Processing` job is considered abandoned
    pub processing_timeout: Duration,
    pub compile: CompileOptions,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "compilation-worker".to_string(),
            pop_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            processing_timeout: Duration::from_secs(300),
            compile: CompileOptions::default().with_timeout(Duration::from_millis(90_000)),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_compile_options(mut self, options: CompileOptions) -> Self {
        self.compile = options;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub queue_depth: u64,
    pub processing_count: u64,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub uptime_secs: u64,
}

/// What the startup sweep did with the processing set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Abandoned jobs moved to `Failed`.
    pub failed: usize,
    /// Stale markers removed (status missing or already terminal).
    pub cleared: usize,
    /// Markers left alone because their job may still be running.
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

pub struct CompilationWorker<S, X> {
    queue: CompilationQueue<S>,
    sandbox: X,
    config: WorkerConfig,
    running: AtomicBool,
    counters: Counters,
    started: Instant,
}

impl<S, X> std::fmt::Debug for CompilationWorker<S, X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationWorker")
            .field("config", &self.config)
            .field("running", &self.running)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl<S, X> CompilationWorker<S, X>
where
    S: RecordStore + 'static,
    X: Sandbox + 'static,
{
    pub fn new(queue: CompilationQueue<S>, sandbox: X, config: WorkerConfig) -> Self {
        Self {
            queue,
            sandbox,
            config,
            running: AtomicBool::new(false),
            counters: Counters::default(),
            started: Instant::now(),
        }
    }

    pub fn queue(&self) -> &CompilationQueue<S> {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the loop to exit after the current pop / job.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Recover, then run the loop in the background.
    pub async fn start(self) -> Result<WorkerHandle<S, X>, WorkerError> {
        let report = self.recover_stuck_jobs().await?;
        if report != RecoveryReport::default() {
            info!(
                worker = %self.config.name,
                failed = report.failed,
                cleared = report.cleared,
                in_flight = report.in_flight,
                "recovery sweep finished"
            );
        }

        let worker = Arc::new(self);
        worker.running.store(true, Ordering::SeqCst);
        let join = tokio::spawn(Arc::clone(&worker).run());

        Ok(WorkerHandle {
            worker,
            join: Some(join),
        })
    }

    async fn run(self: Arc<Self>) {
        info!(worker = %self.config.name, "compilation worker started");

        while self.is_running() {
            if let Err(e) = self.process_next().await {
                error!(worker = %self.config.name, error = %e, "failed to dequeue job");
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        info!(worker = %self.config.name, "compilation worker stopped");
    }

    /// Wait up to `pop_timeout` for one job and process it.
    ///
    /// Returns the processed id, `None` if the wait timed out. Only a failed
    /// pop is an error; per-job failures are recorded on the job.
    pub async fn process_next(self: &Arc<Self>) -> Result<Option<JobId>, WorkerError> {
        let keys = self.queue.keys();
        let Some(raw) = self
            .queue
            .store()
            .blpop(&keys.queue(), self.config.pop_timeout)
            .await?
        else {
            return Ok(None);
        };

        match raw.parse::<JobId>() {
            Ok(job_id) => {
                self.handle_job(job_id).await;
                Ok(Some(job_id))
            }
            Err(e) => {
                warn!(entry = %raw, error = %e, "discarding malformed queue entry");
                Ok(None)
            }
        }
    }

    async fn handle_job(self: &Arc<Self>, job_id: JobId) {
        let worker = Arc::clone(self);
        let joined = tokio::spawn(async move { worker.process_job(job_id).await }).await;

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        let failure = match joined {
            Ok(Ok(terminal)) => {
                self.count_outcome(terminal.as_ref());
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) if e.is_panic() => Some(panic_message(e.into_panic())),
            Err(_) => Some("job processing was cancelled".to_string()),
        };

        if let Some(message) = failure {
            error!(job_id = %job_id, error = %message, "job processing failed unexpectedly");
            match self.fail_unexpected(job_id, &message).await {
                Ok(stored) => self.count_outcome(stored.as_ref()),
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "could not record job failure");
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn count_outcome(&self, stored: Option<&JobState>) {
        match stored {
            Some(JobState::Completed { .. }) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Some(JobState::Failed { .. }) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Claim, compile and record one job. Returns the terminal state written,
    /// or `None` when the job's records had already expired.
    async fn process_job(&self, job_id: JobId) -> Result<Option<JobState>, WorkerError> {
        let clock = self.queue.clock();
        let processing_key = self.queue.keys().processing();
        let member = job_id.to_string();
        let store = self.queue.store();

        store.sadd(&processing_key, &member).await?;

        let Some(current) = self.queue.status(&job_id).await? else {
            warn!(job_id = %job_id, "claimed job has no status record; skipping");
            store.srem(&processing_key, &member).await?;
            return Ok(None);
        };
        let processing = current.start_processing(clock.now())?;
        self.queue.write_status(&job_id, &processing).await?;
        debug!(job_id = %job_id, "job claimed");

        let Some(job) = self.queue.load_job(&job_id).await? else {
            warn!(job_id = %job_id, "job payload missing");
            let failed = processing.fail(clock.now(), JOB_DATA_NOT_FOUND, 0)?;
            self.queue.write_status(&job_id, &failed).await?;
            store.srem(&processing_key, &member).await?;
            return Ok(Some(failed));
        };

        info!(job_id = %job_id, document = %job.document_ref, "compiling job");
        let request = CompileRequest::new(job.source.as_str(), job.base_filename())
            .with_options(self.config.compile);
        let output = self.sandbox.compile(request).await;

        let terminal = match output {
            CompileOutput::Success {
                artifact,
                warnings,
                duration_ms,
            } => {
                let completed = processing.complete(clock.now(), duration_ms, warnings)?;
                let size = artifact.len();
                self.queue.write_completed(&job_id, artifact, &completed).await?;
                info!(job_id = %job_id, duration_ms, artifact_bytes = size, "job completed");
                completed
            }
            CompileOutput::Failure { error, duration_ms } => {
                info!(job_id = %job_id, duration_ms, error = %error, "job failed");
                let failed = processing.fail(clock.now(), error, duration_ms)?;
                self.queue.write_status(&job_id, &failed).await?;
                failed
            }
        };

        store.srem(&processing_key, &member).await?;
        Ok(Some(terminal))
    }

    /// Best-effort `Failed` record after an unexpected error or panic.
    ///
    /// Returns the terminal state now stored. A job that already reached a
    /// terminal state before the error keeps it.
    async fn fail_unexpected(
        &self,
        job_id: JobId,
        message: &str,
    ) -> Result<Option<JobState>, WorkerError> {
        let store = self.queue.store();
        if let Err(e) = store
            .srem(&self.queue.keys().processing(), &job_id.to_string())
            .await
        {
            warn!(job_id = %job_id, error = %e, "could not clear processing marker");
        }

        let now = self.queue.clock().now();
        let failed = match self.queue.status(&job_id).await? {
            None => {
                warn!(job_id = %job_id, "status record gone; nothing to fail");
                return Ok(None);
            }
            Some(state) if state.is_terminal() => return Ok(Some(state)),
            Some(state @ JobState::Pending { .. }) => {
                state.start_processing(now)?.fail(now, message, 0)?
            }
            Some(state) => state.fail(now, message, 0)?,
        };
        self.queue.write_status(&job_id, &failed).await?;
        Ok(Some(failed))
    }

    /// Fail claimed jobs abandoned longer than `processing_timeout` and drop
    /// stale processing markers.
    pub async fn recover_stuck_jobs(&self) -> Result<RecoveryReport, WorkerError> {
        let store = self.queue.store();
        let processing_key = self.queue.keys().processing();
        let members = store.smembers(&processing_key).await?;
        let mut report = RecoveryReport::default();
        if members.is_empty() {
            return Ok(report);
        }

        info!(count = members.len(), "found jobs in processing set");
        let now = self.queue.clock().now();
        let timeout = chrono::Duration::from_std(self.config.processing_timeout)
            .unwrap_or(chrono::Duration::MAX);

        for member in members {
            let Ok(job_id) = member.parse::<JobId>() else {
                store.srem(&processing_key, &member).await?;
                report.cleared += 1;
                continue;
            };

            let state = match self.queue.status(&job_id).await? {
                Some(state) if !state.is_terminal() => state,
                Some(_) | None => {
                    store.srem(&processing_key, &member).await?;
                    report.cleared += 1;
                    continue;
                }
            };

            // A Pending marker means the claimer died before writing
            // Processing; age it from creation.
            let since = state
                .processing_started_at()
                .unwrap_or_else(|| state.created_at());
            if now.signed_duration_since(since) <= timeout {
                report.in_flight += 1;
                continue;
            }

            warn!(job_id = %job_id, status = %state.status(), "failing abandoned job");
            let failed = match state {
                JobState::Pending { .. } => state.start_processing(now)?.fail(now, JOB_TIMED_OUT, 0)?,
                _ => state.fail(now, JOB_TIMED_OUT, 0)?,
            };
            self.queue.write_status(&job_id, &failed).await?;
            store.srem(&processing_key, &member).await?;
            report.failed += 1;
        }

        Ok(report)
    }

    pub async fn stats(&self) -> Result<WorkerStats, WorkerError> {
        let queue = self.queue.stats().await?;
        Ok(WorkerStats {
            queue_depth: queue.queue_depth,
            processing_count: queue.processing_count,
            jobs_processed: self.counters.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.counters.failed.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        })
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle<S, X> {
    worker: Arc<CompilationWorker<S, X>>,
    join: Option<JoinHandle<()>>,
}

impl<S, X> WorkerHandle<S, X>
where
    S: RecordStore + 'static,
    X: Sandbox + 'static,
{
    pub fn worker(&self) -> &Arc<CompilationWorker<S, X>> {
        &self.worker
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub async fn stats(&self) -> Result<WorkerStats, WorkerError> {
        self.worker.stats().await
    }

    /// Request a graceful stop and wait for the loop to finish its current job.
    pub async fn shutdown(mut self) {
        self.worker.stop();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "worker loop terminated abnormally");
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<&'static str>() {
        Ok(message) => (*message).to_string(),
        Err(payload) => match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(_) => "worker panicked while processing job".to_string(),
        },
    }
}
