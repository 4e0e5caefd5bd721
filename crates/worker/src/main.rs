//! Flaglane Worker
//!
//! Long-running process that owns the recurring governance jobs: API usage
//! notifications, overage charging, access restriction and subscription
//! cancellation finalisation.

mod jobs;

use std::sync::Arc;

use tokio_cron_scheduler::JobScheduler;
use tracing::info;

use flaglane_governance::GovernanceService;
use flaglane_shared::db;

use crate::jobs::{register_recurring_jobs, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flaglane_worker=info,flaglane_governance=info".into()),
        )
        .init();

    info!("Starting Flaglane worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = db::create_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let governance = Arc::new(GovernanceService::from_env(pool)?);
    let config = WorkerConfig::from_env();

    let scheduler = JobScheduler::new().await?;
    register_recurring_jobs(&scheduler, governance, &config).await?;
    scheduler.start().await?;

    info!("Worker scheduler started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping worker");

    Ok(())
}
