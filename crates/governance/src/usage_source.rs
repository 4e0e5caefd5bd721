//! Usage query collaborator
//!
//! The time-series analytics backend owns usage computation; this module only
//! asks it "how many API calls did this organisation make in this window".

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{GovernanceError, GovernanceResult};

/// Window for a usage query, rendered as a duration string ("30d", "-25d")
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageWindow {
    pub days: i64,
}

impl UsageWindow {
    pub fn last_days(days: i64) -> Self {
        Self { days }
    }
}

impl std::fmt::Display for UsageWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "-{}d", self.days)
    }
}

/// Source of measured API usage per organisation
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Total API calls for the organisation within the window ending now
    async fn current_usage(&self, organisation_id: Uuid, window: UsageWindow)
        -> GovernanceResult<i64>;
}

/// Configuration for the InfluxDB-backed usage source
#[derive(Debug, Clone)]
pub struct UsageSourceConfig {
    pub influx_url: String,
    pub influx_token: String,
    pub influx_org: String,
    pub bucket: String,
}

impl UsageSourceConfig {
    /// Create config from environment variables
    pub fn from_env() -> GovernanceResult<Self> {
        Ok(Self {
            influx_url: std::env::var("INFLUXDB_URL")
                .map_err(|_| GovernanceError::Config("INFLUXDB_URL not set".to_string()))?,
            influx_token: std::env::var("INFLUXDB_TOKEN")
                .map_err(|_| GovernanceError::Config("INFLUXDB_TOKEN not set".to_string()))?,
            influx_org: std::env::var("INFLUXDB_ORG")
                .map_err(|_| GovernanceError::Config("INFLUXDB_ORG not set".to_string()))?,
            bucket: std::env::var("INFLUXDB_BUCKET")
                .unwrap_or_else(|_| "api_usage".to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct UsageCountResponse {
    total: i64,
}

/// Usage source backed by the InfluxDB HTTP API
#[derive(Clone)]
pub struct InfluxUsageSource {
    config: UsageSourceConfig,
    client: reqwest::Client,
}

impl InfluxUsageSource {
    pub fn new(config: UsageSourceConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> GovernanceResult<Self> {
        Ok(Self::new(UsageSourceConfig::from_env()?))
    }
}

#[async_trait]
impl UsageSource for InfluxUsageSource {
    async fn current_usage(
        &self,
        organisation_id: Uuid,
        window: UsageWindow,
    ) -> GovernanceResult<i64> {
        let flux = format!(
            r#"from(bucket: "{bucket}")
  |> range(start: {window})
  |> filter(fn: (r) => r._measurement == "api_call" and r.organisation_id == "{org}")
  |> sum()"#,
            bucket = self.config.bucket,
            window = window,
            org = organisation_id,
        );

        let response = self
            .client
            .post(format!(
                "{}/api/v2/query?org={}",
                self.config.influx_url, self.config.influx_org
            ))
            .header("Authorization", format!("Token {}", self.config.influx_token))
            .header("Accept", "application/json")
            .header("Content-Type", "application/vnd.flux")
            .body(flux)
            .send()
            .await
            .map_err(|e| GovernanceError::UsageQuery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GovernanceError::UsageQuery(format!(
                "usage query returned {}",
                response.status()
            )));
        }

        let counts: UsageCountResponse = response
            .json()
            .await
            .map_err(|e| GovernanceError::UsageQuery(e.to_string()))?;

        Ok(counts.total)
    }
}
