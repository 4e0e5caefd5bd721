//! Recurring governance job registration
//!
//! Usage evaluation runs twice a day; overage charging runs every half hour
//! so it catches billing terms closing within its one hour lookahead window.
//! Job bodies log failures and return: a bad pass never takes the scheduler
//! down, the next tick is the retry.

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use flaglane_governance::GovernanceService;

/// Twice a day, at minute 0
const NOTIFICATIONS_SCHEDULE: &str = "0 0 */12 * * *";
/// Every 30 minutes
const OVERAGE_SCHEDULE: &str = "0 */30 * * * *";
/// Twice a day, offset from the notification pass
const RESTRICT_SCHEDULE: &str = "0 15 */12 * * *";
const UNRESTRICT_SCHEDULE: &str = "0 30 */12 * * *";
/// Twice a day
const CANCELLATION_SCHEDULE: &str = "0 45 */12 * * *";

/// Worker feature toggles read from the environment
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Master switch for the recurring governance jobs
    pub enable_api_usage_alerting: bool,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            enable_api_usage_alerting: std::env::var("ENABLE_API_USAGE_ALERTING")
                .map(|v| enabled_flag(&v))
                .unwrap_or(false),
        }
    }
}

/// Interpret an environment toggle; anything but "true"/"1" is off
fn enabled_flag(raw: &str) -> bool {
    raw == "true" || raw == "1"
}

/// Register all recurring governance jobs on the scheduler
pub async fn register_recurring_jobs(
    scheduler: &JobScheduler,
    governance: Arc<GovernanceService>,
    config: &WorkerConfig,
) -> anyhow::Result<()> {
    if !config.enable_api_usage_alerting {
        info!("API usage alerting is disabled, skipping governance job registration");
        return Ok(());
    }

    register_notification_job(scheduler, governance.clone()).await?;
    register_overage_job(scheduler, governance.clone()).await?;
    register_restriction_jobs(scheduler, governance.clone()).await?;
    register_cancellation_job(scheduler, governance).await?;

    Ok(())
}

async fn register_notification_job(
    scheduler: &JobScheduler,
    governance: Arc<GovernanceService>,
) -> anyhow::Result<()> {
    let job = Job::new_async(NOTIFICATIONS_SCHEDULE, move |_uuid, _lock| {
        let governance = governance.clone();

        Box::pin(async move {
            info!("Running API usage notification job");
            match governance.notifications.handle_api_usage_notifications().await {
                Ok(sent) => info!(sent = sent, "API usage notification job completed"),
                Err(e) => error!(error = %e, "API usage notification job failed"),
            }
        })
    })?;

    scheduler.add(job).await?;
    info!("Scheduled API usage notifications ({})", NOTIFICATIONS_SCHEDULE);

    Ok(())
}

async fn register_overage_job(
    scheduler: &JobScheduler,
    governance: Arc<GovernanceService>,
) -> anyhow::Result<()> {
    let job = Job::new_async(OVERAGE_SCHEDULE, move |_uuid, _lock| {
        let governance = governance.clone();

        Box::pin(async move {
            match governance.overage.charge_for_api_call_count_overages().await {
                Ok(0) => {}
                Ok(billed) => info!(billed = billed, "API overage charging job completed"),
                Err(e) => error!(error = %e, "API overage charging job failed"),
            }
        })
    })?;

    scheduler.add(job).await?;
    info!("Scheduled API overage charging ({})", OVERAGE_SCHEDULE);

    Ok(())
}

async fn register_restriction_jobs(
    scheduler: &JobScheduler,
    governance: Arc<GovernanceService>,
) -> anyhow::Result<()> {
    let restrict_governance = governance.clone();
    let restrict = Job::new_async(RESTRICT_SCHEDULE, move |_uuid, _lock| {
        let governance = restrict_governance.clone();

        Box::pin(async move {
            info!("Running API limit restriction job");
            match governance
                .restriction
                .restrict_use_due_to_api_limit_grace_period_over()
                .await
            {
                Ok(restricted) => {
                    info!(restricted = restricted, "API limit restriction job completed")
                }
                Err(e) => error!(error = %e, "API limit restriction job failed"),
            }
        })
    })?;
    scheduler.add(restrict).await?;
    info!("Scheduled API limit restriction ({})", RESTRICT_SCHEDULE);

    let unrestrict = Job::new_async(UNRESTRICT_SCHEDULE, move |_uuid, _lock| {
        let governance = governance.clone();

        Box::pin(async move {
            info!("Running API limit unrestriction job");
            match governance
                .restriction
                .unrestrict_after_api_limit_grace_period_is_stale()
                .await
            {
                Ok(lifted) => info!(lifted = lifted, "API limit unrestriction job completed"),
                Err(e) => error!(error = %e, "API limit unrestriction job failed"),
            }
        })
    })?;
    scheduler.add(unrestrict).await?;
    info!("Scheduled API limit unrestriction ({})", UNRESTRICT_SCHEDULE);

    Ok(())
}

async fn register_cancellation_job(
    scheduler: &JobScheduler,
    governance: Arc<GovernanceService>,
) -> anyhow::Result<()> {
    let job = Job::new_async(CANCELLATION_SCHEDULE, move |_uuid, _lock| {
        let governance = governance.clone();

        Box::pin(async move {
            info!("Running subscription cancellation job");
            match governance
                .cancellation
                .finish_subscription_cancellation()
                .await
            {
                Ok(finished) => {
                    info!(finished = finished, "Subscription cancellation job completed")
                }
                Err(e) => error!(error = %e, "Subscription cancellation job failed"),
            }
        })
    })?;

    scheduler.add(job).await?;
    info!("Scheduled subscription cancellations ({})", CANCELLATION_SCHEDULE);

    Ok(())
}
