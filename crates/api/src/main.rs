use std::sync::Arc;

use anyhow::{Context, Result};

use portal_api::app::{build_app, services};
use portal_api::config::AppConfig;
use portal_infra::jobs::spawn_schedule;

#[tokio::main]
async fn main() -> Result<()> {
    portal_observability::init();

    let config = AppConfig::from_env()?;
    let services = services::build_services(&config).await?;

    let schedule = spawn_schedule(
        services.runner.clone(),
        services.queue.clone(),
        config.jobs.schedule(),
    );

    let app = build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    schedule.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
