//! End-to-end queue/worker behaviour against the in-memory store with a fake
//! compiler.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use texforge_core::{DocumentRef, JobId, JobStatus, OwnerRef};
use texforge_infra::{
    ArtifactLookup, CompilationQueue, CompilationWorker, CompileOutput, CompileRequest,
    InMemoryRecordStore, QueueConfig, Sandbox, WorkerConfig,
};

const SOURCE: &str = "\\documentclass{article}\\begin{document}Hello\\end{document}";

/// Echoes the source back as the "PDF", optionally slowly, and panics on a
/// magic marker.
#[derive(Debug, Default)]
struct FakeCompiler {
    delay: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl Sandbox for FakeCompiler {
    async fn compile(&self, request: CompileRequest) -> CompileOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if request.source.contains("PANIC") {
            panic!("compiler exploded");
        }
        CompileOutput::Success {
            artifact: request.source.into_bytes(),
            warnings: None,
            duration_ms: u64::try_from(self.delay.as_millis()).unwrap(),
        }
    }
}

fn setup(
    compiler: FakeCompiler,
) -> (
    CompilationQueue<Arc<InMemoryRecordStore>>,
    CompilationWorker<Arc<InMemoryRecordStore>, Arc<FakeCompiler>>,
    Arc<FakeCompiler>,
) {
    let store = InMemoryRecordStore::arc();
    let queue = CompilationQueue::new(Arc::clone(&store), QueueConfig::default());
    let compiler = Arc::new(compiler);
    let worker = CompilationWorker::new(
        CompilationQueue::new(store, QueueConfig::default()),
        Arc::clone(&compiler),
        WorkerConfig::default()
            .with_name("test-worker")
            .with_pop_timeout(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(10)),
    );
    (queue, worker, compiler)
}

async fn enqueue(queue: &CompilationQueue<Arc<InMemoryRecordStore>>, source: &str) -> JobId {
    queue
        .enqueue(
            OwnerRef::new("owner-1").unwrap(),
            DocumentRef::new("paper").unwrap(),
            source,
        )
        .await
        .unwrap()
}

async fn wait_for_terminal(
    queue: &CompilationQueue<Arc<InMemoryRecordStore>>,
    id: &JobId,
) -> JobStatus {
    for _ in 0..200 {
        let status = queue.status(id).await.unwrap().unwrap().status();
        if status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not reach a terminal state");
}

#[tokio::test]
async fn jobs_complete_in_fifo_order_and_artifacts_become_fetchable() {
    let (queue, worker, _compiler) = setup(FakeCompiler::default());

    let first = enqueue(&queue, SOURCE).await;
    let second = enqueue(&queue, &format!("{SOURCE}%2")).await;
    assert_eq!(queue.depth().await.unwrap(), 2);

    let handle = worker.start().await.unwrap();

    assert_eq!(wait_for_terminal(&queue, &first).await, JobStatus::Completed);
    assert_eq!(wait_for_terminal(&queue, &second).await, JobStatus::Completed);

    let first_done = queue.status(&first).await.unwrap().unwrap().completed_at().unwrap();
    let second_done = queue.status(&second).await.unwrap().unwrap().completed_at().unwrap();
    assert!(first_done <= second_done);

    assert_eq!(
        queue.fetch_artifact(&second).await.unwrap(),
        ArtifactLookup::Ready(format!("{SOURCE}%2").into_bytes())
    );

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.processing_count, 0);
    assert_eq!(stats.jobs_succeeded, 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn cancelled_job_is_never_compiled() {
    let (queue, worker, compiler) = setup(FakeCompiler::default());

    let cancelled = enqueue(&queue, SOURCE).await;
    let kept = enqueue(&queue, SOURCE).await;
    assert!(queue.cancel(&cancelled).await.unwrap());

    let handle = worker.start().await.unwrap();
    assert_eq!(wait_for_terminal(&queue, &kept).await, JobStatus::Completed);
    handle.shutdown().await;

    assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
    let outcome = queue.status(&cancelled).await.unwrap().unwrap().outcome().unwrap();
    assert_eq!(outcome.error.as_deref(), Some("cancelled by user"));
    assert_eq!(
        queue.fetch_artifact(&cancelled).await.unwrap(),
        ArtifactLookup::NotReady(JobStatus::Failed)
    );
}

#[tokio::test]
async fn claimed_job_cannot_be_cancelled() {
    let (queue, worker, _compiler) = setup(FakeCompiler {
        delay: Duration::from_millis(200),
        ..FakeCompiler::default()
    });
    let id = enqueue(&queue, SOURCE).await;
    let handle = worker.start().await.unwrap();

    // Wait until the worker has claimed the job.
    for _ in 0..100 {
        if queue.status(&id).await.unwrap().unwrap().status() == JobStatus::Processing {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(!queue.cancel(&id).await.unwrap());
    assert_eq!(wait_for_terminal(&queue, &id).await, JobStatus::Completed);
    handle.shutdown().await;
}

#[tokio::test]
async fn panicking_job_fails_and_loop_survives() {
    let (queue, worker, _compiler) = setup(FakeCompiler::default());

    let bad = enqueue(&queue, &format!("{SOURCE}%PANIC")).await;
    let good = enqueue(&queue, SOURCE).await;

    let handle = worker.start().await.unwrap();
    assert_eq!(wait_for_terminal(&queue, &bad).await, JobStatus::Failed);
    assert_eq!(wait_for_terminal(&queue, &good).await, JobStatus::Completed);

    let outcome = queue.status(&bad).await.unwrap().unwrap().outcome().unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("compiler exploded"));

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.processing_count, 0);
    assert_eq!((stats.jobs_processed, stats.jobs_failed), (2, 1));
    handle.shutdown().await;
}

#[tokio::test]
async fn stop_waits_for_in_flight_job() {
    let (queue, worker, _compiler) = setup(FakeCompiler {
        delay: Duration::from_millis(150),
        ..FakeCompiler::default()
    });
    let id = enqueue(&queue, SOURCE).await;
    let handle = worker.start().await.unwrap();

    for _ in 0..100 {
        if queue.status(&id).await.unwrap().unwrap().status() == JobStatus::Processing {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    handle.shutdown().await;
    assert_eq!(
        queue.status(&id).await.unwrap().unwrap().status(),
        JobStatus::Completed
    );
}
