//! End-to-end governance flows against a real database
//!
//! These tests seed their own organisations with random identifiers, so they
//! can run against a shared development database. External collaborators
//! (usage source, feature gate, billing, mail) are in-memory fakes.
//!
//! Run with: DATABASE_URL=postgres://... cargo test -- --ignored

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use flaglane_governance::{
    AccessRestrictionService, BillingGateway, FeatureGate, FlagSet, GateTraits, GovernanceError,
    GovernanceResult, Mailer, OverageBillingService, SubscriptionCancellationService,
    UsageNotificationService, UsageSource, UsageWindow, API_CALL_BLOCK_SIZE,
    FREE_PLAN_MAX_API_CALLS,
};

struct FixedUsage {
    per_org: Mutex<HashMap<Uuid, i64>>,
    failing: Mutex<HashSet<Uuid>>,
}

impl FixedUsage {
    fn new() -> Self {
        Self {
            per_org: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    fn set(&self, organisation_id: Uuid, usage: i64) {
        self.per_org
            .lock()
            .unwrap()
            .insert(organisation_id, usage);
    }

    fn fail_for(&self, organisation_id: Uuid) {
        self.failing.lock().unwrap().insert(organisation_id);
    }
}

#[async_trait]
impl UsageSource for FixedUsage {
    async fn current_usage(
        &self,
        organisation_id: Uuid,
        _window: UsageWindow,
    ) -> GovernanceResult<i64> {
        if self.failing.lock().unwrap().contains(&organisation_id) {
            return Err(GovernanceError::UsageQuery(
                "usage backend unavailable".to_string(),
            ));
        }
        Ok(*self
            .per_org
            .lock()
            .unwrap()
            .get(&organisation_id)
            .unwrap_or(&0))
    }
}

struct AllEnabledGate;

#[async_trait]
impl FeatureGate for AllEnabledGate {
    async fn flags_for(&self, _identifier: &str, _traits: &GateTraits) -> FlagSet {
        FlagSet::from_enabled([
            "api_usage_alerting",
            "api_usage_overage_charges",
            "api_limiting_stop_serving_flags",
            "api_limiting_block_admin_access",
        ])
    }
}

#[derive(Default)]
struct RecordingMailer {
    usage_alerts: AtomicUsize,
    cancellation_alerts: AtomicUsize,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_usage_alert(
        &self,
        _recipients: &[String],
        _organisation_name: &str,
        _matched_threshold: i32,
    ) -> bool {
        self.usage_alerts.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn send_subscription_cancelled_alert(
        &self,
        _recipients: &[String],
        _organisation_name: &str,
        _cancellation_date: OffsetDateTime,
    ) -> bool {
        self.cancellation_alerts.fetch_add(1, Ordering::SeqCst);
        true
    }
}

#[derive(Default)]
struct RecordingBilling {
    charges: Mutex<Vec<(String, i64)>>,
}

#[async_trait]
impl BillingGateway for RecordingBilling {
    async fn add_100k_api_calls_scale_up(
        &self,
        subscription_id: &str,
        blocks: i64,
    ) -> GovernanceResult<()> {
        self.charges
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), blocks));
        Ok(())
    }

    async fn add_100k_api_calls_start_up(
        &self,
        subscription_id: &str,
        blocks: i64,
    ) -> GovernanceResult<()> {
        self.charges
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), blocks));
        Ok(())
    }
}

async fn test_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let pool = flaglane_shared::db::create_pool(&url)
        .await
        .expect("Failed to create pool");
    flaglane_shared::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

async fn seed_organisation(pool: &PgPool, plan: &str, max_api_calls: i64) -> Uuid {
    let org_id = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO organisations (id, name, flag_identifier) VALUES ($1, $2, $3)",
    )
    .bind(org_id)
    .bind(format!("Test Org {org_id}"))
    .bind(format!("org-{org_id}"))
    .execute(pool)
    .await
    .unwrap();

    let external_ref = if plan == "free" {
        None
    } else {
        Some(format!("sub-{org_id}"))
    };
    sqlx::query(
        "INSERT INTO subscriptions (id, organisation_id, plan, subscription_id, max_api_calls)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::new_v4())
    .bind(org_id)
    .bind(plan)
    .bind(external_ref)
    .bind(max_api_calls)
    .execute(pool)
    .await
    .unwrap();

    org_id
}

async fn seed_admin(pool: &PgPool, org_id: Uuid) {
    let user_id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, email) VALUES ($1, $2)")
        .bind(user_id)
        .bind(format!("admin-{user_id}@example.com"))
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO user_organisations (user_id, organisation_id, role) VALUES ($1, $2, 'admin')",
    )
    .bind(user_id)
    .bind(org_id)
    .execute(pool)
    .await
    .unwrap();
}

async fn notification_count(pool: &PgPool, org_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM api_usage_notifications WHERE organisation_id = $1")
        .bind(org_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore] // Requires database
async fn test_notification_sent_once_per_period_and_threshold() {
    let pool = test_pool().await;
    let org_id = seed_organisation(&pool, "free", 1_000).await;
    seed_admin(&pool, org_id).await;

    let usage = Arc::new(FixedUsage::new());
    usage.set(org_id, 950); // 95%, matches the 90 threshold

    let mailer = Arc::new(RecordingMailer::default());
    let service = UsageNotificationService::new(
        pool.clone(),
        usage.clone(),
        Arc::new(AllEnabledGate),
        mailer.clone(),
    );

    service.handle_api_usage_notifications().await.unwrap();
    assert_eq!(notification_count(&pool, org_id).await, 1);
    assert_eq!(mailer.usage_alerts.load(Ordering::SeqCst), 1);

    // A second pass with unchanged usage sends nothing new
    service.handle_api_usage_notifications().await.unwrap();
    assert_eq!(notification_count(&pool, org_id).await, 1);
    assert_eq!(mailer.usage_alerts.load(Ordering::SeqCst), 1);

    // Crossing a higher threshold notifies again
    usage.set(org_id, 1_050);
    service.handle_api_usage_notifications().await.unwrap();
    assert_eq!(notification_count(&pool, org_id).await, 2);
    assert_eq!(mailer.usage_alerts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_one_organisation_failing_does_not_abort_the_batch() {
    let pool = test_pool().await;

    // Usage backend failure for one organisation
    let broken_org = seed_organisation(&pool, "free", 1_000).await;
    // Paid organisation whose billing cache was never populated
    let uncached_org = seed_organisation(&pool, "scale-up", 0).await;
    // Healthy organisation over a threshold
    let healthy_org = seed_organisation(&pool, "free", 1_000).await;
    seed_admin(&pool, healthy_org).await;

    let usage = Arc::new(FixedUsage::new());
    usage.fail_for(broken_org);
    usage.set(healthy_org, 950);

    let mailer = Arc::new(RecordingMailer::default());
    let service = UsageNotificationService::new(
        pool.clone(),
        usage,
        Arc::new(AllEnabledGate),
        mailer.clone(),
    );

    // Per-organisation failures are logged and skipped, never propagated
    let sent = service.handle_api_usage_notifications().await.unwrap();
    assert_eq!(sent, 1);

    assert_eq!(notification_count(&pool, healthy_org).await, 1);
    assert_eq!(mailer.usage_alerts.load(Ordering::SeqCst), 1);

    // The failing organisations got no notification rows
    assert_eq!(notification_count(&pool, broken_org).await, 0);
    assert_eq!(notification_count(&pool, uncached_org).await, 0);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_overage_is_charged_once_per_billing_term() {
    let pool = test_pool().await;
    let org_id = seed_organisation(&pool, "scale-up-v2", 500_000).await;
    let now = OffsetDateTime::now_utc();

    // Billing term of 30 days ending in half an hour
    sqlx::query(
        "INSERT INTO subscription_information_cache
         (id, organisation_id, current_billing_term_starts_at, current_billing_term_ends_at,
          allowed_30d_api_calls)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::new_v4())
    .bind(org_id)
    .bind(now - Duration::days(30) + Duration::minutes(30))
    .bind(now + Duration::minutes(30))
    .bind(500_000_i64)
    .execute(&pool)
    .await
    .unwrap();

    // The 100% breach that makes the organisation a charging candidate
    sqlx::query(
        "INSERT INTO api_usage_notifications (id, organisation_id, percent_usage, notified_at)
         VALUES ($1, $2, 100, $3)",
    )
    .bind(Uuid::new_v4())
    .bind(org_id)
    .bind(now - Duration::days(2))
    .execute(&pool)
    .await
    .unwrap();

    let usage = Arc::new(FixedUsage::new());
    usage.set(org_id, 1_250_000); // 250% of the allowance, 750k over

    let billing = Arc::new(RecordingBilling::default());
    let service = OverageBillingService::new(
        pool.clone(),
        usage,
        Arc::new(AllEnabledGate),
        billing.clone(),
    );

    let billed = service.charge_for_api_call_count_overages().await.unwrap();
    assert_eq!(billed, 1);
    {
        let charges = billing.charges.lock().unwrap();
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].1, 8); // 750k over rounds up to 8 blocks
    }

    let ledger: Vec<i64> = sqlx::query_scalar(
        "SELECT api_overage FROM api_billing WHERE organisation_id = $1",
    )
    .bind(org_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(ledger, vec![8 * API_CALL_BLOCK_SIZE]);

    // Unchanged usage on the next run is covered by the ledger
    let billed = service.charge_for_api_call_count_overages().await.unwrap();
    assert_eq!(billed, 0);
    assert_eq!(billing.charges.lock().unwrap().len(), 1);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_restriction_applies_after_grace_and_lifts_when_stale() {
    let pool = test_pool().await;
    let org_id = seed_organisation(&pool, "free", 1_000).await;
    let now = OffsetDateTime::now_utc();

    // Breached 100% eight days ago, past the default seven day grace period
    sqlx::query(
        "INSERT INTO api_usage_notifications (id, organisation_id, percent_usage, notified_at)
         VALUES ($1, $2, 100, $3)",
    )
    .bind(Uuid::new_v4())
    .bind(org_id)
    .bind(now - Duration::days(8))
    .execute(&pool)
    .await
    .unwrap();

    let service =
        AccessRestrictionService::with_grace_period(pool.clone(), Arc::new(AllEnabledGate), 7);

    let restricted = service
        .restrict_use_due_to_api_limit_grace_period_over()
        .await
        .unwrap();
    assert_eq!(restricted, 1);

    let (stop, block): (bool, bool) = sqlx::query_as(
        "SELECT stop_serving_flags, block_admin_access FROM organisations WHERE id = $1",
    )
    .bind(org_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(stop);
    assert!(block);

    // Already restricted, a second pass is a no-op
    let restricted = service
        .restrict_use_due_to_api_limit_grace_period_over()
        .await
        .unwrap();
    assert_eq!(restricted, 0);

    // The breach marker is still inside the rolling window: not lifted
    let lifted = service
        .unrestrict_after_api_limit_grace_period_is_stale()
        .await
        .unwrap();
    assert_eq!(lifted, 0);

    // Age the marker out of the window; the restriction lifts
    sqlx::query(
        "UPDATE api_usage_notifications SET notified_at = $2 WHERE organisation_id = $1",
    )
    .bind(org_id)
    .bind(now - Duration::days(31))
    .execute(&pool)
    .await
    .unwrap();

    let lifted = service
        .unrestrict_after_api_limit_grace_period_is_stale()
        .await
        .unwrap();
    assert_eq!(lifted, 1);

    let (stop, block): (bool, bool) = sqlx::query_as(
        "SELECT stop_serving_flags, block_admin_access FROM organisations WHERE id = $1",
    )
    .bind(org_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(!stop);
    assert!(!block);

    let blocks: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM api_limit_access_blocks WHERE organisation_id = $1",
    )
    .bind(org_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(blocks, 0);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_cancellation_reverts_to_free_plan_and_alerts_admins() {
    let pool = test_pool().await;
    let org_id = seed_organisation(&pool, "start-up-v2", 1_000_000).await;
    seed_admin(&pool, org_id).await;
    let now = OffsetDateTime::now_utc();

    sqlx::query(
        "UPDATE subscriptions SET cancellation_date = $2 WHERE organisation_id = $1",
    )
    .bind(org_id)
    .bind(now - Duration::hours(1))
    .execute(&pool)
    .await
    .unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let service = SubscriptionCancellationService::new(pool.clone(), mailer.clone());

    let finished = service.finish_subscription_cancellation().await.unwrap();
    assert_eq!(finished, 1);
    assert_eq!(mailer.cancellation_alerts.load(Ordering::SeqCst), 1);

    let (plan, external_ref, max_api_calls, cancellation_date): (
        String,
        Option<String>,
        i64,
        Option<OffsetDateTime>,
    ) = sqlx::query_as(
        "SELECT plan, subscription_id, max_api_calls, cancellation_date
         FROM subscriptions WHERE organisation_id = $1",
    )
    .bind(org_id)
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(plan, "free");
    assert_eq!(external_ref, None);
    assert_eq!(max_api_calls, FREE_PLAN_MAX_API_CALLS);
    assert_eq!(cancellation_date, None);

    // The cancellation date was cleared, a second pass finds nothing
    let finished = service.finish_subscription_cancellation().await.unwrap();
    assert_eq!(finished, 0);
}
