//! CourseHub worker process
//!
//! Connects to Redis, serves the configured job queues and drains in-flight
//! jobs on Ctrl-C.

mod cli;
mod processors;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use coursehub_jobs::{JobCoordinator, JobsConfig, RedisBackend, ShutdownOutcome, WorkerPool};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,coursehub_jobs=debug"));
    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = JobsConfig::from_env().context("failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let backend = Arc::new(
        RedisBackend::connect(&config.redis_url, &config.key_prefix)
            .await
            .with_context(|| format!("failed to connect to {}", config.redis_url))?,
    );

    let coordinator = Arc::new(JobCoordinator::new(backend.clone()));
    coordinator
        .initialize(config.coordinator_config()?)
        .await
        .context("failed to initialize job coordinator")?;

    let worker_config = config.worker_config()?;
    let shutdown_timeout = worker_config.shutdown_timeout;
    let pool = processors::register_all(
        WorkerPool::builder(backend, worker_config),
        coordinator.clone(),
    )
    // the coordinator owns the connection and closes it last
    .close_backend_on_shutdown(false)
    .build()
    .context("failed to build worker pool")?;

    pool.start().await.context("failed to start worker pool")?;
    tracing::info!(
        queues = ?pool.config().queues,
        concurrency = pool.config().concurrency,
        "Worker running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown signal received");

    match pool.shutdown(shutdown_timeout).await {
        ShutdownOutcome::Drained => tracing::info!("All in-flight jobs finished"),
        ShutdownOutcome::TimedOut { abandoned } => tracing::warn!(
            abandoned,
            "Shutdown timed out, abandoned jobs will be reclaimed as stalled"
        ),
    }
    coordinator.shutdown().await?;

    let metrics = pool.metrics();
    tracing::info!(
        processed = metrics.jobs_processed,
        failed = metrics.jobs_failed,
        "Worker stopped"
    );
    Ok(())
}
