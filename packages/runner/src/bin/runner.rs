// Main entry point for the job runner

use std::sync::Arc;

use anyhow::{Context, Result};
use runner_core::tasks::{self, TaskDeps};
use runner_core::{InMemoryQueueStore, JobPlatform, PlatformConfig, TaskRegistry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,runner_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    tracing::info!("Starting job runner");

    let config = PlatformConfig::from_env().context("Failed to load platform configuration")?;
    let graceful = config.graceful_shutdown;
    tracing::info!("Configuration loaded");

    // Discovery pass: register every bundled task
    let deps = Arc::new(TaskDeps {
        queue_store: Arc::new(InMemoryQueueStore::new()),
    });
    let mut registry = TaskRegistry::new();
    tasks::register_builtin(&mut registry, deps).context("Task discovery failed")?;
    tracing::info!(job_types = registry.len(), "Task discovery complete");

    let platform = JobPlatform::new(registry, config);
    platform
        .start()
        .await
        .context("Platform failed to start")?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    platform.stop(graceful).await;
    Ok(())
}
