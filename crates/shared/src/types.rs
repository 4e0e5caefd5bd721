//! Common types used across Flaglane

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Commercial plan for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Plan {
    Free,
    StartUp,
    StartUpV2,
    ScaleUp,
    ScaleUpV2,
    Enterprise,
}

impl Default for Plan {
    fn default() -> Self {
        Self::Free
    }
}

/// Plan family used to pick the external billing mutation for overage charges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingFamily {
    StartUp,
    ScaleUp,
}

impl Plan {
    /// Whether this is the free plan (rolling 30-day window, no billing term)
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }

    /// The billing family for overage charges, if this plan has one
    /// Enterprise overages are handled manually and have no mapping
    pub fn billing_family(&self) -> Option<BillingFamily> {
        match self {
            Self::StartUp | Self::StartUpV2 => Some(BillingFamily::StartUp),
            Self::ScaleUp | Self::ScaleUpV2 => Some(BillingFamily::ScaleUp),
            Self::Free | Self::Enterprise => None,
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::StartUp => write!(f, "start-up"),
            Self::StartUpV2 => write!(f, "start-up-v2"),
            Self::ScaleUp => write!(f, "scale-up"),
            Self::ScaleUpV2 => write!(f, "scale-up-v2"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl std::str::FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "start-up" => Ok(Self::StartUp),
            "start-up-v2" => Ok(Self::StartUpV2),
            "scale-up" => Ok(Self::ScaleUp),
            "scale-up-v2" => Ok(Self::ScaleUpV2),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(format!("Invalid plan: {}", s)),
        }
    }
}

/// User role within an organisation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrganisationRole {
    Admin,
    Member,
}

impl Default for OrganisationRole {
    fn default() -> Self {
        Self::Member
    }
}

impl std::fmt::Display for OrganisationRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::Member => write!(f, "member"),
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Organisation (tenant) model
///
/// The restriction flags are mutated only by the access restriction passes;
/// everything else reads them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organisation {
    pub id: Uuid,
    pub name: String,
    /// Identity handed to the feature-flag collaborator for per-org gating
    pub flag_identifier: String,
    pub stop_serving_flags: bool,
    pub block_admin_access: bool,
    pub created_at: OffsetDateTime,
}

/// Subscription model (one per organisation)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub organisation_id: Uuid,
    /// Plan identifier; parse with [`Plan`] where the family matters
    pub plan: String,
    /// External billing reference, absent for free organisations
    pub subscription_id: Option<String>,
    /// Allowance for free-tier organisations (paid tiers use the cache)
    pub max_api_calls: i64,
    pub cancellation_date: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Subscription {
    pub fn is_free_plan(&self) -> bool {
        self.plan.parse::<Plan>().map(|p| p.is_free()).unwrap_or(false)
    }
}

/// Cached external billing-term information for paid organisations
///
/// Refreshed by an external cache updater; must exist before a paid
/// organisation's usage can be evaluated.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionInformationCache {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub current_billing_term_starts_at: OffsetDateTime,
    pub current_billing_term_ends_at: OffsetDateTime,
    pub allowed_30d_api_calls: i64,
    pub updated_at: OffsetDateTime,
}

/// Append-only record of a threshold notification having been sent
///
/// One row per (organisation, period, threshold); rows are never updated.
/// The row itself is the idempotency marker for later passes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApiUsageNotification {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub percent_usage: i32,
    pub notified_at: OffsetDateTime,
}

/// Append-only ledger of overage charges made within a billing term
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApiBilling {
    pub id: Uuid,
    pub organisation_id: Uuid,
    /// Billed overage, always a multiple of the 100k block size
    pub api_overage: i64,
    pub billed_at: OffsetDateTime,
    pub immediate_invoice: bool,
}

/// Marker record whose existence means "currently restricted"
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApiLimitAccessBlock {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Tests
// =============================================================================
