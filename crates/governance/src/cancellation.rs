//! Finalising subscription cancellations
//!
//! When a paid subscription's cancellation date passes, the organisation is
//! moved back to the free plan and its admins are told. The 24 hour lookback
//! keeps each cancellation from being reprocessed indefinitely while still
//! tolerating a couple of missed scheduler runs.

use std::sync::Arc;

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use flaglane_shared::types::Plan;

use crate::error::GovernanceResult;
use crate::mailer::Mailer;
use crate::recipients::admin_emails;

/// API call allowance an organisation reverts to on the free plan
pub const FREE_PLAN_MAX_API_CALLS: i64 = 50_000;

#[derive(Debug, sqlx::FromRow)]
struct PendingCancellation {
    organisation_id: Uuid,
    organisation_name: String,
    cancellation_date: OffsetDateTime,
}

/// Completes subscription cancellations whose effective date has passed
pub struct SubscriptionCancellationService {
    pool: PgPool,
    mailer: Arc<dyn Mailer>,
}

impl SubscriptionCancellationService {
    pub fn new(pool: PgPool, mailer: Arc<dyn Mailer>) -> Self {
        Self { pool, mailer }
    }

    /// One finalisation pass. Returns how many subscriptions were reverted.
    pub async fn finish_subscription_cancellation(&self) -> GovernanceResult<usize> {
        let now = OffsetDateTime::now_utc();
        let lookback = now - Duration::hours(24);

        let pending: Vec<PendingCancellation> = sqlx::query_as(
            r#"
            SELECT s.organisation_id, o.name AS organisation_name, s.cancellation_date
            FROM subscriptions s
            JOIN organisations o ON o.id = s.organisation_id
            WHERE s.cancellation_date IS NOT NULL
              AND s.cancellation_date < $1
              AND s.cancellation_date > $2
            ORDER BY s.cancellation_date
            "#,
        )
        .bind(now)
        .bind(lookback)
        .fetch_all(&self.pool)
        .await?;

        let mut finished = 0;
        for cancellation in pending {
            match self.finish_one(&cancellation).await {
                Ok(()) => finished += 1,
                Err(e) => {
                    tracing::error!(
                        org_id = %cancellation.organisation_id,
                        error = %e,
                        "Error finishing subscription cancellation"
                    );
                }
            }
        }

        Ok(finished)
    }

    async fn finish_one(&self, cancellation: &PendingCancellation) -> GovernanceResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET plan = $2, subscription_id = NULL, max_api_calls = $3,
                cancellation_date = NULL
            WHERE organisation_id = $1
            "#,
        )
        .bind(cancellation.organisation_id)
        .bind(Plan::Free.to_string())
        .bind(FREE_PLAN_MAX_API_CALLS)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            org_id = %cancellation.organisation_id,
            cancellation_date = %cancellation.cancellation_date,
            "Reverted organisation to the free plan after cancellation"
        );

        let recipients = admin_emails(&self.pool, cancellation.organisation_id).await?;
        self.mailer
            .send_subscription_cancelled_alert(
                &recipients,
                &cancellation.organisation_name,
                cancellation.cancellation_date,
            )
            .await;

        Ok(())
    }
}
