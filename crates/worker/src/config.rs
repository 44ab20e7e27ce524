//! Worker configuration

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub redis_url: String,
    pub queue_prefix: String,
    pub archival_concurrency: usize,
    pub billing_concurrency: usize,
    /// Dashboard base URL used in confirmation replies.
    pub app_url: Option<String>,
    /// Fallback token when a Discord integration has none of its own.
    pub discord_bot_token: Option<String>,
    pub resend_api_key: Option<String>,
    pub email_from: String,
    /// Operator webhook for archival failures; logged when unset.
    pub error_webhook_url: Option<String>,
    pub json_logs: bool,
}

// Secrets stay out of logs.
impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[redacted]");
        f.debug_struct("WorkerConfig")
            .field("queue_prefix", &self.queue_prefix)
            .field("archival_concurrency", &self.archival_concurrency)
            .field("billing_concurrency", &self.billing_concurrency)
            .field("app_url", &self.app_url)
            .field("discord_bot_token", &redact(&self.discord_bot_token))
            .field("resend_api_key", &redact(&self.resend_api_key))
            .field("email_from", &self.email_from)
            .field("error_webhook_url", &redact(&self.error_webhook_url))
            .field("json_logs", &self.json_logs)
            .finish()
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));
        let concurrency = |name: &'static str| -> Result<usize, ConfigError> {
            match var(name) {
                None => Ok(5),
                Some(raw) => match raw.trim().parse::<usize>() {
                    Ok(n) if n > 0 => Ok(n),
                    _ => Err(ConfigError::Invalid {
                        name,
                        reason: format!("expected a positive integer, got \"{raw}\""),
                    }),
                },
            }
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: required("REDIS_URL")?,
            queue_prefix: var("QUEUE_PREFIX").unwrap_or_else(|| "threadbase".to_string()),
            archival_concurrency: concurrency("ARCHIVAL_CONCURRENCY")?,
            billing_concurrency: concurrency("BILLING_CONCURRENCY")?,
            app_url: var("APP_URL"),
            discord_bot_token: var("DISCORD_BOT_TOKEN"),
            resend_api_key: var("RESEND_API_KEY"),
            email_from: var("EMAIL_FROM")
                .unwrap_or_else(|| "Threadbase <notifications@threadbase.app>".to_string()),
            error_webhook_url: var("ERROR_WEBHOOK_URL"),
            json_logs: var("LOG_FORMAT").as_deref() == Some("json"),
        })
    }
}
