//! Threshold-crossing usage notifications
//!
//! Periodic pass over all organisations: resolve the usage period, query
//! measured usage, match the highest crossed threshold, and notify once per
//! (organisation, period, threshold). The appended api_usage_notifications
//! row is the durable "already notified" marker consumed by later runs and by
//! the overage and restriction passes.

use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use flaglane_shared::types::{Organisation, Subscription, SubscriptionInformationCache};

use crate::error::GovernanceResult;
use crate::flags::{FeatureGate, GateTraits, FLAG_API_USAGE_ALERTING};
use crate::mailer::Mailer;
use crate::period::resolve_usage_period;
use crate::recipients::{admin_emails, all_member_emails};
use crate::thresholds::{matched_threshold, API_USAGE_ALERT_THRESHOLDS};
use crate::usage_source::{UsageSource, UsageWindow};

/// Sends API usage threshold notifications
pub struct UsageNotificationService {
    pool: PgPool,
    usage: Arc<dyn UsageSource>,
    gate: Arc<dyn FeatureGate>,
    mailer: Arc<dyn Mailer>,
}

impl UsageNotificationService {
    pub fn new(
        pool: PgPool,
        usage: Arc<dyn UsageSource>,
        gate: Arc<dyn FeatureGate>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            pool,
            usage,
            gate,
            mailer,
        }
    }

    /// Evaluate every organisation and send any due threshold notification.
    ///
    /// Per-organisation failures are logged and never abort the batch.
    /// Returns how many notifications were sent.
    pub async fn handle_api_usage_notifications(&self) -> GovernanceResult<usize> {
        let organisations: Vec<Organisation> = sqlx::query_as(
            "SELECT id, name, flag_identifier, stop_serving_flags, block_admin_access, created_at
             FROM organisations ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut sent = 0;
        for organisation in organisations {
            let subscription: Option<Subscription> = sqlx::query_as(
                "SELECT id, organisation_id, plan, subscription_id, max_api_calls,
                        cancellation_date, created_at
                 FROM subscriptions WHERE organisation_id = $1",
            )
            .bind(organisation.id)
            .fetch_optional(&self.pool)
            .await?;

            let Some(subscription) = subscription else {
                tracing::error!(
                    org_id = %organisation.id,
                    "Organisation has no subscription, skipping usage evaluation"
                );
                continue;
            };

            let traits = GateTraits {
                organisation_id: organisation.id,
                plan: subscription.plan.clone(),
            };
            let flags = self
                .gate
                .flags_for(&organisation.flag_identifier, &traits)
                .await;
            if !flags.is_enabled(FLAG_API_USAGE_ALERTING) {
                continue;
            }

            match self
                .handle_organisation(&organisation, &subscription)
                .await
            {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        org_id = %organisation.id,
                        error = %e,
                        "Error processing api usage for organisation"
                    );
                }
            }
        }

        Ok(sent)
    }

    /// Evaluate a single organisation; returns whether a notification was sent
    async fn handle_organisation(
        &self,
        organisation: &Organisation,
        subscription: &Subscription,
    ) -> GovernanceResult<bool> {
        let now = OffsetDateTime::now_utc();

        let cache: Option<SubscriptionInformationCache> = sqlx::query_as(
            "SELECT id, organisation_id, current_billing_term_starts_at,
                    current_billing_term_ends_at, allowed_30d_api_calls, updated_at
             FROM subscription_information_cache WHERE organisation_id = $1",
        )
        .bind(organisation.id)
        .fetch_optional(&self.pool)
        .await?;

        let period = resolve_usage_period(organisation.id, subscription, cache.as_ref(), now)?;

        let api_usage = self
            .usage
            .current_usage(organisation.id, UsageWindow::last_days(period.days))
            .await?;

        let Some(threshold) = matched_threshold(
            api_usage,
            period.allowed_api_calls,
            &API_USAGE_ALERT_THRESHOLDS,
        ) else {
            // Didn't match even the lowest threshold, so no notification
            return Ok(false);
        };

        if self
            .already_notified(organisation.id, period.starts_at, threshold)
            .await?
        {
            // Already sent an equal-or-higher alert this period, don't resend
            return Ok(false);
        }

        self.send_api_usage_notification(organisation, threshold, now)
            .await?;

        Ok(true)
    }

    /// Idempotency gate: has an equal-or-higher threshold already been
    /// notified for this organisation within the current period?
    async fn already_notified(
        &self,
        organisation_id: Uuid,
        period_starts_at: OffsetDateTime,
        threshold: i32,
    ) -> GovernanceResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM api_usage_notifications
                WHERE organisation_id = $1
                  AND notified_at > $2
                  AND percent_usage >= $3
            )
            "#,
        )
        .bind(organisation_id)
        .bind(period_starts_at)
        .bind(threshold)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    /// Send the alert and append the durable notification marker.
    ///
    /// Only admins are included when the matched threshold is under 100% of
    /// the allowance; at or over the limit every member is notified. Mail
    /// delivery is best-effort; the marker row is written regardless so the
    /// same threshold is not re-attempted every pass.
    async fn send_api_usage_notification(
        &self,
        organisation: &Organisation,
        threshold: i32,
        now: OffsetDateTime,
    ) -> GovernanceResult<()> {
        let recipients = if threshold < 100 {
            admin_emails(&self.pool, organisation.id).await?
        } else {
            all_member_emails(&self.pool, organisation.id).await?
        };

        self.mailer
            .send_usage_alert(&recipients, &organisation.name, threshold)
            .await;

        sqlx::query(
            r#"
            INSERT INTO api_usage_notifications (id, organisation_id, percent_usage, notified_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(organisation.id)
        .bind(threshold)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            org_id = %organisation.id,
            matched_threshold = threshold,
            recipients = recipients.len(),
            "Recorded API usage notification"
        );

        Ok(())
    }
}
