//! API server configuration

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Where webhook rate-limit windows are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStore {
    /// Shared across API replicas.
    Redis,
    /// Per process; idle windows are pruned on a timer.
    Memory,
}

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub redis_url: String,
    /// Prefix for queue and rate limiter keys in Redis.
    pub queue_prefix: String,
    /// Bearer token the archive trigger must present.
    pub archive_ingress_secret: String,
    pub stripe_webhook_secret: Option<String>,
    pub slack_signing_secret: Option<String>,
    /// Hex-encoded Ed25519 application public key.
    pub discord_public_key: Option<String>,
    /// Reaction name (without colons) that archives a Slack thread.
    pub slack_archive_reaction: String,
    pub rate_limit_store: RateLimitStore,
    pub log_format: LogFormat,
}

// Secrets stay out of logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[redacted]");
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("queue_prefix", &self.queue_prefix)
            .field("archive_ingress_secret", &"[redacted]")
            .field("stripe_webhook_secret", &redact(&self.stripe_webhook_secret))
            .field("slack_signing_secret", &redact(&self.slack_signing_secret))
            .field("discord_public_key", &self.discord_public_key)
            .field("slack_archive_reaction", &self.slack_archive_reaction)
            .field("rate_limit_store", &self.rate_limit_store)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));

        let rate_limit_store = match var("RATE_LIMIT_STORE").as_deref() {
            None | Some("redis") => RateLimitStore::Redis,
            Some("memory") => RateLimitStore::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "RATE_LIMIT_STORE",
                    reason: format!("expected \"redis\" or \"memory\", got \"{other}\""),
                })
            }
        };

        let log_format = match var("LOG_FORMAT").as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "LOG_FORMAT",
                    reason: format!("expected \"pretty\" or \"json\", got \"{other}\""),
                })
            }
        };

        Ok(Self {
            bind_address: var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            redis_url: required("REDIS_URL")?,
            queue_prefix: var("QUEUE_PREFIX").unwrap_or_else(|| "threadbase".to_string()),
            archive_ingress_secret: required("ARCHIVE_INGRESS_SECRET")?,
            stripe_webhook_secret: var("STRIPE_WEBHOOK_SECRET"),
            slack_signing_secret: var("SLACK_SIGNING_SECRET"),
            discord_public_key: var("DISCORD_PUBLIC_KEY"),
            slack_archive_reaction: var("SLACK_ARCHIVE_REACTION")
                .map(|r| r.trim_matches(':').to_string())
                .unwrap_or_else(|| "books".to_string()),
            rate_limit_store,
            log_format,
        })
    }
}
