use std::sync::Arc;

use anyhow::Context;

use texforge_infra::{
    CompilationQueue, CompilationWorker, RedisRecordStore, Settings, TectonicSandbox,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    texforge_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    let store = RedisRecordStore::connect(&settings.redis_url)
        .await
        .with_context(|| format!("failed to connect to {}", settings.redis_url))?;
    tracing::info!(redis = %settings.redis_url, "connected to record store");

    let queue = CompilationQueue::new(Arc::new(store), settings.queue.clone());
    let sandbox = TectonicSandbox::new(settings.sandbox.clone());
    let handle = CompilationWorker::new(queue, sandbox, settings.worker.clone())
        .start()
        .await
        .context("worker startup failed")?;

    let app = texforge_worker::health_router(Arc::clone(handle.worker()));
    let listener = tokio::net::TcpListener::bind(settings.worker_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.worker_addr))?;
    tracing::info!("health endpoint listening on {}", listener.local_addr()?);

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "health server failed");
        }
    });

    texforge_worker::shutdown_signal().await;
    tracing::info!("shutdown requested; finishing in-flight job");

    handle.shutdown().await;
    server.abort();
    Ok(())
}
