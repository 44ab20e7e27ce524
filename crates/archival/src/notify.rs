//! Operator error reporting and customer usage notifications

use async_trait::async_trait;
use serde::Serialize;
use threadbase_shared::Plan;
use uuid::Uuid;

use crate::platform::http_client;

pub const RESEND_API_BASE: &str = "https://api.resend.com";

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub component: &'static str,
    pub message: String,
    pub context: serde_json::Value,
}

/// Sink for failures an operator should see. Reporting never fails the caller.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report(&self, report: ErrorReport);
}

#[derive(Debug, Default)]
pub struct LogErrorReporter;

#[async_trait]
impl ErrorReporter for LogErrorReporter {
    async fn report(&self, report: ErrorReport) {
        tracing::error!(
            component = report.component,
            context = %report.context,
            "{}",
            report.message
        );
    }
}

/// Posts reports as JSON to an operator webhook.
pub struct WebhookErrorReporter {
    client: reqwest::Client,
    url: String,
}

impl WebhookErrorReporter {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl ErrorReporter for WebhookErrorReporter {
    async fn report(&self, report: ErrorReport) {
        let result = self.client.post(&self.url).json(&report).send().await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => tracing::warn!(
                status = %response.status(),
                component = report.component,
                "Error webhook rejected report"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                component = report.component,
                "Failed to deliver error report"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageLevel {
    /// At 80% of the monthly limit.
    Approaching,
    Reached,
}

impl UsageLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageLevel::Approaching => "APPROACHING",
            UsageLevel::Reached => "REACHED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageNotice {
    pub organization_id: Uuid,
    pub organization_name: String,
    pub owner_email: String,
    pub plan: Plan,
    pub used: i64,
    pub limit: i64,
    pub level: UsageLevel,
}

impl UsageNotice {
    pub fn subject(&self) -> String {
        match self.level {
            UsageLevel::Approaching => format!(
                "{} has used {} of {} archives this month",
                self.organization_name, self.used, self.limit
            ),
            UsageLevel::Reached => format!(
                "{} has reached its monthly archive limit",
                self.organization_name
            ),
        }
    }

    pub fn body(&self) -> String {
        let headline = match self.level {
            UsageLevel::Approaching => "You're approaching your monthly archive limit.",
            UsageLevel::Reached => "You've reached your monthly archive limit.",
        };
        format!(
            "{headline}\n\nPlan: {}\nArchived this month: {} of {}\n\nUpgrade your plan to keep archiving conversations.",
            self.plan, self.used, self.limit
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("usage notification failed: {0}")]
pub struct NotifyError(String);

#[async_trait]
pub trait UsageNotifier: Send + Sync {
    async fn notify(&self, notice: &UsageNotice) -> Result<(), NotifyError>;
}

#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl UsageNotifier for LogNotifier {
    async fn notify(&self, notice: &UsageNotice) -> Result<(), NotifyError> {
        tracing::info!(
            org_id = %notice.organization_id,
            used = notice.used,
            limit = notice.limit,
            level = ?notice.level,
            "Usage notification (email not configured)"
        );
        Ok(())
    }
}

/// Plain-text email through the Resend API.
pub struct ResendNotifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    from: String,
}

impl ResendNotifier {
    pub fn new(api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self::with_base_url(RESEND_API_BASE, api_key, from)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            from: from.into(),
        }
    }
}

#[async_trait]
impl UsageNotifier for ResendNotifier {
    async fn notify(&self, notice: &UsageNotice) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "from": self.from,
                "to": [notice.owner_email],
                "subject": notice.subject(),
                "text": notice.body(),
            }))
            .send()
            .await
            .map_err(|e| NotifyError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError(format!("HTTP {status}: {body}")));
        }

        tracing::info!(
            org_id = %notice.organization_id,
            level = ?notice.level,
            "Usage notification sent"
        );
        Ok(())
    }
}
