//! Feature-flag gating for governance actions
//!
//! Every notification, billing and restriction action is gated per
//! organisation so rollout can be staged. The gate is an injected capability;
//! evaluation failure fails safe to "everything disabled".

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

/// Gate names evaluated per organisation
pub const FLAG_API_USAGE_ALERTING: &str = "api_usage_alerting";
pub const FLAG_API_USAGE_OVERAGE_CHARGES: &str = "api_usage_overage_charges";
pub const FLAG_API_LIMITING_STOP_SERVING_FLAGS: &str = "api_limiting_stop_serving_flags";
pub const FLAG_API_LIMITING_BLOCK_ADMIN_ACCESS: &str = "api_limiting_block_admin_access";

/// Traits sent alongside the organisation identity for flag evaluation
#[derive(Debug, Clone)]
pub struct GateTraits {
    pub organisation_id: Uuid,
    pub plan: String,
}

/// Evaluated flag state for one organisation
#[derive(Debug, Clone, Default)]
pub struct FlagSet {
    enabled: HashSet<String>,
}

impl FlagSet {
    /// All-disabled set, used when evaluation fails
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_enabled<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.contains(name)
    }
}

/// Per-organisation feature gate
#[async_trait]
pub trait FeatureGate: Send + Sync {
    /// Evaluate flags for an organisation identity. Never fails: evaluation
    /// errors degrade to an all-disabled [`FlagSet`].
    async fn flags_for(&self, identifier: &str, traits: &GateTraits) -> FlagSet;
}

/// Configuration for the HTTP flag-evaluation client
#[derive(Debug, Clone)]
pub struct FeatureGateConfig {
    /// Base URL of the flag evaluation API
    pub api_url: String,
    /// Environment key sent with every evaluation request
    pub environment_key: String,
}

impl FeatureGateConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            api_url: std::env::var("FLAG_API_URL")
                .unwrap_or_else(|_| "http://localhost:8000/api/v1".to_string()),
            environment_key: std::env::var("FLAG_ENVIRONMENT_KEY").unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EvaluatedFlag {
    feature: String,
    enabled: bool,
}

/// Feature gate backed by the platform's own flag-evaluation API
#[derive(Clone)]
pub struct HttpFeatureGate {
    config: FeatureGateConfig,
    client: reqwest::Client,
}

impl HttpFeatureGate {
    pub fn new(config: FeatureGateConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(FeatureGateConfig::from_env())
    }
}

#[async_trait]
impl FeatureGate for HttpFeatureGate {
    async fn flags_for(&self, identifier: &str, traits: &GateTraits) -> FlagSet {
        let body = serde_json::json!({
            "identifier": identifier,
            "traits": {
                "organisation_id": traits.organisation_id,
                "subscription.plan": traits.plan,
            },
        });

        let response = self
            .client
            .post(format!("{}/identities/flags", self.config.api_url))
            .header("X-Environment-Key", &self.config.environment_key)
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                tracing::warn!(
                    identifier = %identifier,
                    status = %resp.status(),
                    "Flag evaluation returned an error status, treating all gates as disabled"
                );
                return FlagSet::disabled();
            }
            Err(e) => {
                tracing::warn!(
                    identifier = %identifier,
                    error = %e,
                    "Flag evaluation request failed, treating all gates as disabled"
                );
                return FlagSet::disabled();
            }
        };

        match response.json::<Vec<EvaluatedFlag>>().await {
            Ok(flags) => FlagSet::from_enabled(
                flags
                    .into_iter()
                    .filter(|f| f.enabled)
                    .map(|f| f.feature),
            ),
            Err(e) => {
                tracing::warn!(
                    identifier = %identifier,
                    error = %e,
                    "Flag evaluation response was unparseable, treating all gates as disabled"
                );
                FlagSet::disabled()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_set_membership() {
        let flags = FlagSet::from_enabled([FLAG_API_USAGE_ALERTING]);
        assert!(flags.is_enabled(FLAG_API_USAGE_ALERTING));
        assert!(!flags.is_enabled(FLAG_API_USAGE_OVERAGE_CHARGES));
    }

    #[test]
    fn test_disabled_set_has_nothing_enabled() {
        let flags = FlagSet::disabled();
        assert!(!flags.is_enabled(FLAG_API_USAGE_ALERTING));
        assert!(!flags.is_enabled(FLAG_API_LIMITING_STOP_SERVING_FLAGS));
    }
}
