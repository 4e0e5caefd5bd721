//! Flaglane Usage Governance
//!
//! Recurring evaluation of measured API usage against subscription
//! allowances: threshold notifications, end-of-term overage charges,
//! access restriction for persistently over-limit free organisations,
//! and finalisation of subscription cancellations.
//!
//! Everything here is driven by the worker's scheduler; the services own
//! no state beyond the database and their injected collaborators.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod billing_gateway;
pub mod cancellation;
pub mod error;
pub mod flags;
pub mod mailer;
pub mod notifications;
pub mod overage;
pub mod period;
mod recipients;
pub mod restriction;
pub mod thresholds;
pub mod usage_source;

pub use billing_gateway::{BillingGateway, ChargebeeClient, ChargebeeConfig, API_CALL_BLOCK_SIZE};
pub use cancellation::{SubscriptionCancellationService, FREE_PLAN_MAX_API_CALLS};
pub use error::{GovernanceError, GovernanceResult};
pub use flags::{FeatureGate, FeatureGateConfig, FlagSet, GateTraits, HttpFeatureGate};
pub use mailer::{EmailConfig, Mailer, ResendMailer};
pub use notifications::UsageNotificationService;
pub use overage::OverageBillingService;
pub use period::{resolve_usage_period, UsagePeriod, FREE_PLAN_WINDOW_DAYS};
pub use restriction::AccessRestrictionService;
pub use thresholds::{matched_threshold, API_USAGE_ALERT_THRESHOLDS};
pub use usage_source::{InfluxUsageSource, UsageSource, UsageSourceConfig, UsageWindow};

use std::sync::Arc;

use sqlx::PgPool;

/// All governance services wired against one pool and one set of
/// collaborators, as the worker consumes them.
pub struct GovernanceService {
    pub notifications: UsageNotificationService,
    pub overage: OverageBillingService,
    pub restriction: AccessRestrictionService,
    pub cancellation: SubscriptionCancellationService,
}

impl GovernanceService {
    pub fn new(
        pool: PgPool,
        usage: Arc<dyn UsageSource>,
        gate: Arc<dyn FeatureGate>,
        billing: Arc<dyn BillingGateway>,
        mailer: Arc<dyn Mailer>,
    ) -> GovernanceResult<Self> {
        Ok(Self {
            notifications: UsageNotificationService::new(
                pool.clone(),
                usage.clone(),
                gate.clone(),
                mailer.clone(),
            ),
            overage: OverageBillingService::new(pool.clone(), usage, gate.clone(), billing),
            restriction: AccessRestrictionService::new(pool.clone(), gate)?,
            cancellation: SubscriptionCancellationService::new(pool, mailer),
        })
    }

    /// Build the production wiring from environment variables
    pub fn from_env(pool: PgPool) -> GovernanceResult<Self> {
        let usage: Arc<dyn UsageSource> = Arc::new(InfluxUsageSource::from_env()?);
        let gate: Arc<dyn FeatureGate> = Arc::new(HttpFeatureGate::from_env());
        let billing: Arc<dyn BillingGateway> = Arc::new(ChargebeeClient::from_env()?);
        let mailer: Arc<dyn Mailer> = Arc::new(ResendMailer::from_env());

        Self::new(pool, usage, gate, billing, mailer)
    }
}
