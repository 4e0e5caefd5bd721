//! Email notifications for usage governance events
//!
//! Sends transactional emails via Resend API. Delivery is best-effort:
//! failures are logged and swallowed, they never abort a governance pass.

use async_trait::async_trait;
use time::OffsetDateTime;

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    /// Dashboard URL
    pub dashboard_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Flaglane <noreply@flaglane.com>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Flaglane".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "https://app.flaglane.com".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// Best-effort mail delivery for governance notifications
///
/// Every method returns whether the send succeeded; callers may record the
/// attempt either way since the next scheduled pass is the retry mechanism.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Threshold-crossing alert ("API use has reached N%")
    async fn send_usage_alert(
        &self,
        recipients: &[String],
        organisation_name: &str,
        matched_threshold: i32,
    ) -> bool;

    /// Admin alert that an organisation's subscription cancellation completed
    async fn send_subscription_cancelled_alert(
        &self,
        recipients: &[String],
        organisation_name: &str,
        cancellation_date: OffsetDateTime,
    ) -> bool;
}

/// Governance email service backed by the Resend API
#[derive(Clone)]
pub struct ResendMailer {
    config: EmailConfig,
    client: reqwest::Client,
}

impl ResendMailer {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    /// Send an email via Resend API
    ///
    /// Returns `true` if the email was sent successfully, `false` otherwise.
    /// Failures are logged and never propagate.
    async fn send_email(&self, to: &[String], subject: &str, html: &str) -> bool {
        if to.is_empty() {
            return false;
        }
        if !self.config.is_enabled() {
            tracing::warn!(
                recipients = to.len(),
                subject = %subject,
                "Email not configured, skipping"
            );
            return false;
        }

        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": to,
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resend_api_key),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(recipients = to.len(), subject = %subject, "Governance email sent");
                true
            }
            Ok(resp) => {
                let status = resp.status();
                tracing::error!(
                    recipients = to.len(),
                    subject = %subject,
                    status = %status,
                    "Failed to send governance email - non-fatal"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    recipients = to.len(),
                    subject = %subject,
                    error = %e,
                    "Failed to send governance email - non-fatal"
                );
                false
            }
        }
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send_usage_alert(
        &self,
        recipients: &[String],
        organisation_name: &str,
        matched_threshold: i32,
    ) -> bool {
        let subject = format!(
            "{} API use has reached {}%",
            self.config.app_name, matched_threshold
        );

        let body = if matched_threshold < 100 {
            format!(
                "<p>The organisation <strong>{org}</strong> has reached {pct}% of its API usage allowance for the current period.</p>\
                 <p>Consider upgrading the plan before the limit is reached.</p>\
                 <p><a href=\"{url}/usage\">Review usage</a></p>",
                org = organisation_name,
                pct = matched_threshold,
                url = self.config.dashboard_url,
            )
        } else {
            format!(
                "<p>The organisation <strong>{org}</strong> has used {pct}% of its API usage allowance for the current period.</p>\
                 <p>Flag serving and admin access may be restricted if usage stays over the limit.</p>\
                 <p><a href=\"{url}/usage\">Review usage</a></p>",
                org = organisation_name,
                pct = matched_threshold,
                url = self.config.dashboard_url,
            )
        };

        self.send_email(recipients, &subject, &body).await
    }

    async fn send_subscription_cancelled_alert(
        &self,
        recipients: &[String],
        organisation_name: &str,
        cancellation_date: OffsetDateTime,
    ) -> bool {
        let subject = format!(
            "Organisation {} has cancelled their subscription",
            organisation_name
        );
        let body = format!(
            "<p>Organisation <strong>{}</strong> has cancelled their subscription on {}.</p>",
            organisation_name,
            cancellation_date.date(),
        );

        self.send_email(recipients, &subject, &body).await
    }
}
