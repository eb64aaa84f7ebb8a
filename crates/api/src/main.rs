use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use provisioner_api::app::{build_app, services::AppServices};
use provisioner_infra::config::Config;
use provisioner_infra::jobs::{Reaper, Worker, WorkerConfig, WorkerHandle};
use provisioner_infra::rate_limit::Sweeper;

#[tokio::main]
async fn main() {
    provisioner_observability::init();

    if let Err(e) = run().await {
        tracing::error!(error = format!("{e:#}"), "provisioner-api exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(config = ?config, "configuration loaded");

    let services = Arc::new(AppServices::from_config(&config).await?);

    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "provisioner".to_string());
    let mut background: Vec<WorkerHandle> = (1..=config.worker_concurrency)
        .map(|n| {
            Worker::spawn(
                WorkerConfig::new(format!("{host}-{n}")).with_poll_interval(config.worker_poll_interval),
                services.queue.clone(),
                services.provisioner.clone(),
            )
        })
        .collect();
    background.push(Reaper::spawn(services.queue.clone(), config.reaper_interval));
    background.push(Sweeper::spawn(services.counters.clone(), config.rate_limit.window));

    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    tracing::info!("stopping background tasks");
    for handle in background {
        handle.shutdown().await;
    }
    served.context("server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
