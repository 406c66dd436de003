use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use texforge_infra::{
    CompilationQueue, CompilationWorker, CompileOutput, CompileRequest, InMemoryRecordStore,
    QueueConfig, Sandbox, WorkerConfig,
};

struct NeverCalled;

#[async_trait]
impl Sandbox for NeverCalled {
    async fn compile(&self, _request: CompileRequest) -> CompileOutput {
        CompileOutput::failure("unexpected compile", 0)
    }
}

#[tokio::test]
async fn health_reports_worker_counters() {
    let store = InMemoryRecordStore::arc();
    let queue = CompilationQueue::new(Arc::clone(&store), QueueConfig::default());
    let handle = CompilationWorker::new(
        queue,
        NeverCalled,
        WorkerConfig::default().with_pop_timeout(Duration::from_millis(20)),
    )
    .start()
    .await
    .unwrap();

    let app = texforge_worker::health_router(Arc::clone(handle.worker()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let res = reqwest::get(format!("{base_url}/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["running"], true);
    assert_eq!(body["queue_depth"], 0);
    assert_eq!(body["jobs_processed"], 0);

    handle.shutdown().await;
    server.abort();
}
