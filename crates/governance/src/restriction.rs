//! Access restriction for free organisations persistently over their limit
//!
//! Two passes run on the same schedule: `restrict_use_due_to_api_limit_grace_period_over`
//! flips serving/admin restrictions for free organisations that breached 100%
//! and have been given a grace period to upgrade, and
//! `unrestrict_after_api_limit_grace_period_is_stale` lifts restrictions for
//! organisations whose breach marker has aged out of the rolling window.

use std::collections::HashSet;
use std::sync::Arc;

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{GovernanceError, GovernanceResult};
use crate::flags::{
    FeatureGate, GateTraits, FLAG_API_LIMITING_BLOCK_ADMIN_ACCESS,
    FLAG_API_LIMITING_STOP_SERVING_FLAGS,
};
use crate::period::FREE_PLAN_WINDOW_DAYS;

/// Days an over-limit organisation gets to upgrade before restriction
const DEFAULT_GRACE_PERIOD_DAYS: i64 = 7;

/// Pure set difference: blocked organisations that no longer breach
pub fn organisations_to_lift(blocked: &[Uuid], breaching: &HashSet<Uuid>) -> Vec<Uuid> {
    blocked
        .iter()
        .filter(|id| !breaching.contains(id))
        .copied()
        .collect()
}

#[derive(Debug, sqlx::FromRow)]
struct RestrictionCandidate {
    id: Uuid,
    flag_identifier: String,
    plan: String,
}

/// Applies and lifts access restrictions on over-limit free organisations
pub struct AccessRestrictionService {
    pool: PgPool,
    gate: Arc<dyn FeatureGate>,
    grace_period_days: i64,
}

impl AccessRestrictionService {
    pub fn new(pool: PgPool, gate: Arc<dyn FeatureGate>) -> GovernanceResult<Self> {
        let grace_period_days = match std::env::var("API_USAGE_GRACE_PERIOD_DAYS") {
            Ok(raw) => raw.parse::<i64>().map_err(|_| {
                GovernanceError::Config(format!(
                    "API_USAGE_GRACE_PERIOD_DAYS is not a number: {raw}"
                ))
            })?,
            Err(_) => DEFAULT_GRACE_PERIOD_DAYS,
        };

        Ok(Self {
            pool,
            gate,
            grace_period_days,
        })
    }

    /// Construct with an explicit grace period instead of reading the environment
    pub fn with_grace_period(pool: PgPool, gate: Arc<dyn FeatureGate>, days: i64) -> Self {
        Self {
            pool,
            gate,
            grace_period_days: days,
        }
    }

    /// Restrict free organisations whose grace period after breaching 100%
    /// has elapsed. Returns how many organisations were restricted.
    pub async fn restrict_use_due_to_api_limit_grace_period_over(
        &self,
    ) -> GovernanceResult<usize> {
        let now = OffsetDateTime::now_utc();
        let window_start = now - Duration::days(FREE_PLAN_WINDOW_DAYS);
        let grace_cutoff = now - Duration::days(self.grace_period_days);

        // Free organisations that breached 100% within the rolling window,
        // at least grace-period days ago, not already fully restricted and
        // not already recorded as blocked.
        let candidates: Vec<RestrictionCandidate> = sqlx::query_as(
            r#"
            SELECT o.id, o.flag_identifier, s.plan
            FROM organisations o
            JOIN subscriptions s ON s.organisation_id = o.id
            WHERE s.plan = 'free'
              AND NOT (o.stop_serving_flags AND o.block_admin_access)
              AND NOT EXISTS (
                  SELECT 1 FROM api_limit_access_blocks b WHERE b.organisation_id = o.id
              )
              AND EXISTS (
                  SELECT 1 FROM api_usage_notifications n
                  WHERE n.organisation_id = o.id
                    AND n.percent_usage >= 100
                    AND n.notified_at > $1
                    AND n.notified_at <= $2
              )
            ORDER BY o.id
            "#,
        )
        .bind(window_start)
        .bind(grace_cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut to_restrict: Vec<(Uuid, bool, bool)> = Vec::new();
        for candidate in candidates {
            let traits = GateTraits {
                organisation_id: candidate.id,
                plan: candidate.plan.clone(),
            };
            let flags = self
                .gate
                .flags_for(&candidate.flag_identifier, &traits)
                .await;

            let stop_serving = flags.is_enabled(FLAG_API_LIMITING_STOP_SERVING_FLAGS);
            let block_admin = flags.is_enabled(FLAG_API_LIMITING_BLOCK_ADMIN_ACCESS);
            if !stop_serving && !block_admin {
                continue;
            }

            tracing::info!(
                org_id = %candidate.id,
                stop_serving_flags = stop_serving,
                block_admin_access = block_admin,
                "Restricting organisation access after grace period"
            );
            to_restrict.push((candidate.id, stop_serving, block_admin));
        }

        if to_restrict.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = to_restrict.iter().map(|(id, _, _)| *id).collect();
        let stops: Vec<bool> = to_restrict.iter().map(|(_, s, _)| *s).collect();
        let blocks: Vec<bool> = to_restrict.iter().map(|(_, _, b)| *b).collect();

        sqlx::query(
            r#"
            UPDATE organisations o
            SET stop_serving_flags = o.stop_serving_flags OR v.stop_serving,
                block_admin_access = o.block_admin_access OR v.block_admin
            FROM unnest($1::uuid[], $2::bool[], $3::bool[])
                AS v(organisation_id, stop_serving, block_admin)
            WHERE o.id = v.organisation_id
            "#,
        )
        .bind(&ids)
        .bind(&stops)
        .bind(&blocks)
        .execute(&self.pool)
        .await?;

        // The access-block row is the durable marker the lift pass keys on.
        // ON CONFLICT guards against a concurrent pass inserting first.
        sqlx::query(
            r#"
            INSERT INTO api_limit_access_blocks (id, organisation_id, created_at)
            SELECT gen_random_uuid(), organisation_id, $2
            FROM unnest($1::uuid[]) AS v(organisation_id)
            ON CONFLICT (organisation_id) DO NOTHING
            "#,
        )
        .bind(&ids)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(ids.len())
    }

    /// Lift restrictions for organisations no longer over their limit.
    ///
    /// An organisation stays restricted as long as any 100% breach marker
    /// remains inside the rolling window; once the last one ages out, its
    /// flags are reset and the access block removed. Returns how many
    /// organisations were unrestricted.
    pub async fn unrestrict_after_api_limit_grace_period_is_stale(
        &self,
    ) -> GovernanceResult<usize> {
        let now = OffsetDateTime::now_utc();
        let window_start = now - Duration::days(FREE_PLAN_WINDOW_DAYS);

        let blocked: Vec<Uuid> = sqlx::query_scalar(
            "SELECT organisation_id FROM api_limit_access_blocks ORDER BY organisation_id",
        )
        .fetch_all(&self.pool)
        .await?;

        if blocked.is_empty() {
            return Ok(0);
        }

        let breaching: HashSet<Uuid> = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT organisation_id FROM api_usage_notifications
            WHERE organisation_id = ANY($1)
              AND percent_usage >= 100
              AND notified_at > $2
            "#,
        )
        .bind(&blocked)
        .bind(window_start)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .collect();

        let to_lift = organisations_to_lift(&blocked, &breaching);
        if to_lift.is_empty() {
            return Ok(0);
        }

        sqlx::query(
            r#"
            UPDATE organisations
            SET stop_serving_flags = false, block_admin_access = false
            WHERE id = ANY($1)
            "#,
        )
        .bind(&to_lift)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM api_limit_access_blocks WHERE organisation_id = ANY($1)")
            .bind(&to_lift)
            .execute(&self.pool)
            .await?;

        for id in &to_lift {
            tracing::info!(org_id = %id, "Lifted API limit access restriction");
        }

        Ok(to_lift.len())
    }
}
