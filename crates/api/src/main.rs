use std::sync::Arc;

use anyhow::Context;

use texforge_api::app::{build_app, services::AppServices};
use texforge_infra::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    texforge_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    let services = AppServices::connect(&settings)
        .await
        .with_context(|| format!("failed to connect to {}", settings.redis_url))?;

    let app = build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(settings.api_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.api_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
