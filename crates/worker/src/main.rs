use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use dagops_events::StateChanged;
use dagops_infra::{
    Engine, EngineConfig, NoopProcessor, PostgresJobStore, ProcessorRegistry,
    TaskProcessingService, TaskProcessors,
};
use dagops_observability::tracing::LogConfig;

/// Processors known to this worker. Applications without a group complete
/// their tasks without processing.
fn processors() -> ProcessorRegistry {
    ProcessorRegistry::new().register(TaskProcessors::new("noop").with_default(NoopProcessor))
}

fn log_job_changes(change: &StateChanged) {
    if change.task_id().is_none() {
        tracing::info!(job_id = %change.job_id(), state = %change.state(), "job state changed");
    }
}

/// One connection per task slot plus headroom for the job loop and sweeps.
fn pool_size(task_slots: usize) -> anyhow::Result<u32> {
    let slots = u32::try_from(task_slots)
        .with_context(|| format!("task slot count {task_slots} does not fit a connection pool"))?;
    Ok(slots.saturating_add(4))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dagops_observability::tracing::init(&LogConfig::from_env());

    let config = EngineConfig::from_env();
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(pool_size(config.task_slots)?)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresJobStore::new(pool);
    store.migrate().await.context("failed to apply migrations")?;

    let service = Arc::new(TaskProcessingService::new(
        store,
        Arc::new(processors()),
        log_job_changes,
    ));
    let engine = Engine::new(service, &config);
    engine.start();
    tracing::info!(task_slots = config.task_slots, "worker started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutting down");
    engine.stop();
    if !engine.join().await {
        anyhow::bail!("an engine loop ended abnormally");
    }
    Ok(())
}
