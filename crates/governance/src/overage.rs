//! Overage charging for organisations past 200% of their allowance
//!
//! Runs frequently but only acts on monthly-billed paid organisations whose
//! billing term is about to close (ends within the next hour), so a charge
//! lands on the invoice being finalised. The api_billing ledger written in
//! the same pass is what prevents double charging on subsequent runs.

use std::str::FromStr;
use std::sync::Arc;

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use flaglane_shared::types::{BillingFamily, Plan};

use crate::billing_gateway::{BillingGateway, API_CALL_BLOCK_SIZE};
use crate::error::{GovernanceError, GovernanceResult};
use crate::flags::{FeatureGate, GateTraits, FLAG_API_USAGE_OVERAGE_CHARGES};
use crate::usage_source::{UsageSource, UsageWindow};

/// Usage below this multiple of the allowance is never charged
const OVERAGE_GRACE_MULTIPLIER: f64 = 2.0;

/// Heuristic bounds for a "roughly monthly" billing term, in days.
/// Kept as-is: wide enough to catch real monthly subscriptions, narrow
/// enough to rule out quarterly or annual terms.
const MONTH_WINDOW_START_DAYS: i64 = 25;
const MONTH_WINDOW_END_DAYS: i64 = 35;

/// Compute the billable overage in 100k blocks, or `None` when no charge is
/// due: limit not positive, usage under the 200% grace threshold, or the
/// allowance plus previously billed overage already covers the usage.
pub fn billable_blocks(api_usage: i64, allowed_api_calls: i64, previous_overage: i64) -> Option<i64> {
    if allowed_api_calls <= 0 {
        return None;
    }

    // Grace period for organisations under 200% of usage
    if (api_usage as f64) / (allowed_api_calls as f64) < OVERAGE_GRACE_MULTIPLIER {
        return None;
    }

    let api_limit = allowed_api_calls + previous_overage;
    let api_overage = api_usage - api_limit;
    if api_overage <= 0 {
        return None;
    }

    // Round up to whole 100k blocks
    Some((api_overage + API_CALL_BLOCK_SIZE - 1) / API_CALL_BLOCK_SIZE)
}

#[derive(Debug, sqlx::FromRow)]
struct OverageCandidate {
    id: Uuid,
    flag_identifier: String,
    plan: String,
    subscription_id: Option<String>,
    current_billing_term_starts_at: OffsetDateTime,
    allowed_30d_api_calls: i64,
}

/// Charges organisations for API call overages at the end of the billing term
pub struct OverageBillingService {
    pool: PgPool,
    usage: Arc<dyn UsageSource>,
    gate: Arc<dyn FeatureGate>,
    billing: Arc<dyn BillingGateway>,
}

impl OverageBillingService {
    pub fn new(
        pool: PgPool,
        usage: Arc<dyn UsageSource>,
        gate: Arc<dyn FeatureGate>,
        billing: Arc<dyn BillingGateway>,
    ) -> Self {
        Self {
            pool,
            usage,
            gate,
            billing,
        }
    }

    /// One charging pass. Returns how many organisations were billed.
    pub async fn charge_for_api_call_count_overages(&self) -> GovernanceResult<usize> {
        let now = OffsetDateTime::now_utc();

        // Only organisations that breached 100% recently are of interest for
        // the relevant billing period (ie, this month).
        let api_usage_notified_at = now - Duration::days(30);

        // Only apply charges to ongoing subscriptions that are close to being
        // invoiced due to being at the end of the billing term.
        let closing_billing_term = now + Duration::hours(1);

        let candidates: Vec<OverageCandidate> = sqlx::query_as(
            r#"
            SELECT o.id, o.flag_identifier, s.plan, s.subscription_id,
                   c.current_billing_term_starts_at, c.allowed_30d_api_calls
            FROM organisations o
            JOIN subscriptions s ON s.organisation_id = o.id
            JOIN subscription_information_cache c ON c.organisation_id = o.id
            WHERE s.plan <> 'free'
              AND o.id IN (
                  SELECT DISTINCT organisation_id FROM api_usage_notifications
                  WHERE notified_at >= $1 AND percent_usage >= 100
              )
              AND c.current_billing_term_ends_at <= $2
              AND c.current_billing_term_ends_at >= $3
              AND c.current_billing_term_starts_at <= c.current_billing_term_ends_at - make_interval(days => $4)
              AND c.current_billing_term_starts_at >= c.current_billing_term_ends_at - make_interval(days => $5)
            ORDER BY o.id
            "#,
        )
        .bind(api_usage_notified_at)
        .bind(closing_billing_term)
        .bind(now)
        .bind(MONTH_WINDOW_START_DAYS as i32)
        .bind(MONTH_WINDOW_END_DAYS as i32)
        .fetch_all(&self.pool)
        .await?;

        let mut billed = 0;
        for candidate in candidates {
            let traits = GateTraits {
                organisation_id: candidate.id,
                plan: candidate.plan.clone(),
            };
            let flags = self
                .gate
                .flags_for(&candidate.flag_identifier, &traits)
                .await;
            if !flags.is_enabled(FLAG_API_USAGE_OVERAGE_CHARGES) {
                continue;
            }

            match self.charge_organisation(&candidate, now).await {
                Ok(true) => billed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        org_id = %candidate.id,
                        error = %e,
                        "Error charging API overage for organisation"
                    );
                }
            }
        }

        Ok(billed)
    }

    /// Charge a single eligible organisation; returns whether a charge was made
    async fn charge_organisation(
        &self,
        candidate: &OverageCandidate,
        now: OffsetDateTime,
    ) -> GovernanceResult<bool> {
        let api_usage = self
            .usage
            .current_usage(candidate.id, UsageWindow::last_days(30))
            .await?;

        let previous_overage: i64 = sqlx::query_scalar::<_, Option<i64>>(
            r#"
            SELECT SUM(api_overage)::BIGINT FROM api_billing
            WHERE organisation_id = $1 AND billed_at >= $2
            "#,
        )
        .bind(candidate.id)
        .bind(candidate.current_billing_term_starts_at)
        .fetch_one(&self.pool)
        .await?
        .unwrap_or(0);

        let Some(blocks) =
            billable_blocks(api_usage, candidate.allowed_30d_api_calls, previous_overage)
        else {
            tracing::info!(
                org_id = %candidate.id,
                api_usage = api_usage,
                allowed = candidate.allowed_30d_api_calls,
                previous_overage = previous_overage,
                "API usage below grace threshold or current API limit"
            );
            return Ok(false);
        };

        let Some(subscription_id) = candidate.subscription_id.as_deref() else {
            tracing::error!(
                org_id = %candidate.id,
                plan = %candidate.plan,
                "Paid organisation has no external subscription reference, cannot bill"
            );
            return Ok(false);
        };

        let family = Plan::from_str(&candidate.plan)
            .ok()
            .and_then(|p| p.billing_family());
        match family {
            Some(BillingFamily::ScaleUp) => {
                self.billing
                    .add_100k_api_calls_scale_up(subscription_id, blocks)
                    .await?;
            }
            Some(BillingFamily::StartUp) => {
                self.billing
                    .add_100k_api_calls_start_up(subscription_id, blocks)
                    .await?;
            }
            None => {
                let err = GovernanceError::UnsupportedPlan(candidate.plan.clone());
                tracing::error!(org_id = %candidate.id, "{}", err);
                return Ok(false);
            }
        }

        // Save a copy of what was just billed in order to avoid double
        // billing on a subsequent run.
        sqlx::query(
            r#"
            INSERT INTO api_billing (id, organisation_id, api_overage, billed_at, immediate_invoice)
            VALUES ($1, $2, $3, $4, false)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(candidate.id)
        .bind(blocks * API_CALL_BLOCK_SIZE)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            org_id = %candidate.id,
            blocks = blocks,
            api_overage = blocks * API_CALL_BLOCK_SIZE,
            "Recorded API overage billing"
        );

        Ok(true)
    }
}
