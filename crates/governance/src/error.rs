//! Governance error types

use thiserror::Error;
use uuid::Uuid;

/// Usage-governance specific errors
#[derive(Debug, Error)]
pub enum GovernanceError {
    /// Paid organisation has no subscription information cache; the caller
    /// logs this and moves on to the next organisation.
    #[error("Paid organisation {0} is missing subscription information cache")]
    MissingBillingCache(Uuid),

    /// Overage billing was invoked for a plan with no billing mapping
    #[error("Unable to bill for API overages for plan `{0}`")]
    UnsupportedPlan(String),

    #[error("Usage query error: {0}")]
    UsageQuery(String),

    #[error("Billing API error: {0}")]
    Billing(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for GovernanceError {
    fn from(err: sqlx::Error) -> Self {
        GovernanceError::Database(err.to_string())
    }
}

pub type GovernanceResult<T> = Result<T, GovernanceError>;
