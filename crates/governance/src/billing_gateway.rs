//! External billing mutations for overage charges
//!
//! The billing provider exposes one "add N blocks of 100k API calls" addon
//! per commercial plan family. Charges are idempotent on the provider side;
//! our own double-charge protection lives in the api_billing ledger.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{GovernanceError, GovernanceResult};

/// Calls per billed overage block
pub const API_CALL_BLOCK_SIZE: i64 = 100_000;

/// Billing provider mutations, one per plan family
#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// Charge a scale-up subscription for `blocks` x 100k extra API calls
    async fn add_100k_api_calls_scale_up(
        &self,
        subscription_id: &str,
        blocks: i64,
    ) -> GovernanceResult<()>;

    /// Charge a start-up subscription for `blocks` x 100k extra API calls
    async fn add_100k_api_calls_start_up(
        &self,
        subscription_id: &str,
        blocks: i64,
    ) -> GovernanceResult<()>;
}

/// Configuration for the Chargebee billing client
#[derive(Debug, Clone)]
pub struct ChargebeeConfig {
    /// Site subdomain, e.g. "flaglane" for flaglane.chargebee.com
    pub site: String,
    pub api_key: String,
    /// Addon id charged for scale-up family overages
    pub scale_up_addon_id: String,
    /// Addon id charged for start-up family overages
    pub start_up_addon_id: String,
}

impl ChargebeeConfig {
    /// Create config from environment variables
    pub fn from_env() -> GovernanceResult<Self> {
        Ok(Self {
            site: std::env::var("CHARGEBEE_SITE")
                .map_err(|_| GovernanceError::Config("CHARGEBEE_SITE not set".to_string()))?,
            api_key: std::env::var("CHARGEBEE_API_KEY")
                .map_err(|_| GovernanceError::Config("CHARGEBEE_API_KEY not set".to_string()))?,
            scale_up_addon_id: std::env::var("CHARGEBEE_ADDON_100K_SCALE_UP")
                .unwrap_or_else(|_| "additional-api-scale-up-monthly".to_string()),
            start_up_addon_id: std::env::var("CHARGEBEE_ADDON_100K_START_UP")
                .unwrap_or_else(|_| "additional-api-start-up-monthly".to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChargebeeErrorBody {
    message: String,
}

/// Chargebee billing client
#[derive(Clone)]
pub struct ChargebeeClient {
    config: ChargebeeConfig,
    client: reqwest::Client,
}

impl ChargebeeClient {
    pub fn new(config: ChargebeeConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> GovernanceResult<Self> {
        Ok(Self::new(ChargebeeConfig::from_env()?))
    }

    /// Add a one-off addon charge to the subscription's pending invoice
    async fn add_addon_charge(
        &self,
        subscription_id: &str,
        addon_id: &str,
        blocks: i64,
    ) -> GovernanceResult<()> {
        let url = format!(
            "https://{}.chargebee.com/api/v2/subscriptions/{}/charge_future_renewals",
            self.config.site, subscription_id
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.api_key, None::<&str>)
            .form(&[
                ("addons[id][0]", addon_id.to_string()),
                ("addons[quantity][0]", blocks.to_string()),
            ])
            .send()
            .await
            .map_err(|e| GovernanceError::Billing(e.to_string()))?;

        if response.status().is_success() {
            tracing::info!(
                subscription_id = %subscription_id,
                addon_id = %addon_id,
                blocks = blocks,
                "Billed API call overage blocks"
            );
            return Ok(());
        }

        let status = response.status();
        let message = response
            .json::<ChargebeeErrorBody>()
            .await
            .map(|b| b.message)
            .unwrap_or_else(|_| "unreadable error body".to_string());

        Err(GovernanceError::Billing(format!(
            "charge for {} failed with {}: {}",
            subscription_id, status, message
        )))
    }
}

#[async_trait]
impl BillingGateway for ChargebeeClient {
    async fn add_100k_api_calls_scale_up(
        &self,
        subscription_id: &str,
        blocks: i64,
    ) -> GovernanceResult<()> {
        let addon_id = self.config.scale_up_addon_id.clone();
        self.add_addon_charge(subscription_id, &addon_id, blocks).await
    }

    async fn add_100k_api_calls_start_up(
        &self,
        subscription_id: &str,
        blocks: i64,
    ) -> GovernanceResult<()> {
        let addon_id = self.config.start_up_addon_id.clone();
        self.add_addon_charge(subscription_id, &addon_id, blocks).await
    }
}
