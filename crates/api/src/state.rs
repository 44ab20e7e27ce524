//! Application state

use std::sync::Arc;

use threadbase_archival::{DiscordSignatureVerifier, SignatureVerifier, SlackSignatureVerifier};
use threadbase_billing::StripeWebhookVerifier;
use threadbase_shared::{JobQueue, RateLimiter};

use crate::config::{Config, ConfigError};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub archival_queue: Arc<dyn JobQueue>,
    pub billing_queue: Arc<dyn JobQueue>,
    /// Per-IP limiter for Stripe webhook ingress
    pub rate_limiter: Arc<RateLimiter>,
    /// `None` disables the Stripe webhook route
    pub stripe_verifier: Option<Arc<StripeWebhookVerifier>>,
    pub slack_verifier: Option<Arc<dyn SignatureVerifier>>,
    pub discord_verifier: Option<Arc<dyn SignatureVerifier>>,
    pub archive_secret: Arc<str>,
    pub slack_archive_reaction: Arc<str>,
}

impl AppState {
    /// Queues and a limiter with no webhook verifiers configured.
    pub fn new(
        archival_queue: Arc<dyn JobQueue>,
        billing_queue: Arc<dyn JobQueue>,
        rate_limiter: Arc<RateLimiter>,
        archive_secret: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            archival_queue,
            billing_queue,
            rate_limiter,
            stripe_verifier: None,
            slack_verifier: None,
            discord_verifier: None,
            archive_secret: archive_secret.into(),
            slack_archive_reaction: Arc::from("books"),
        }
    }

    pub fn from_config(
        config: &Config,
        archival_queue: Arc<dyn JobQueue>,
        billing_queue: Arc<dyn JobQueue>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self, ConfigError> {
        let mut state = Self::new(
            archival_queue,
            billing_queue,
            rate_limiter,
            config.archive_ingress_secret.as_str(),
        )
        .with_slack_reaction(&config.slack_archive_reaction);

        if let Some(secret) = &config.stripe_webhook_secret {
            state = state.with_stripe(StripeWebhookVerifier::new(secret.clone()));
        } else {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set - Stripe webhooks disabled");
        }

        if let Some(secret) = &config.slack_signing_secret {
            state = state.with_slack(SlackSignatureVerifier::new(secret.clone()));
        } else {
            tracing::warn!("SLACK_SIGNING_SECRET not set - Slack events disabled");
        }

        if let Some(key) = &config.discord_public_key {
            let verifier =
                DiscordSignatureVerifier::from_hex(key).map_err(|e| ConfigError::Invalid {
                    name: "DISCORD_PUBLIC_KEY",
                    reason: e.to_string(),
                })?;
            state = state.with_discord(verifier);
        } else {
            tracing::warn!("DISCORD_PUBLIC_KEY not set - Discord interactions disabled");
        }

        Ok(state)
    }

    pub fn with_stripe(mut self, verifier: StripeWebhookVerifier) -> Self {
        self.stripe_verifier = Some(Arc::new(verifier));
        self
    }

    pub fn with_slack(mut self, verifier: SlackSignatureVerifier) -> Self {
        self.slack_verifier = Some(Arc::new(verifier));
        self
    }

    pub fn with_discord(mut self, verifier: DiscordSignatureVerifier) -> Self {
        self.discord_verifier = Some(Arc::new(verifier));
        self
    }

    pub fn with_slack_reaction(mut self, reaction: &str) -> Self {
        self.slack_archive_reaction = Arc::from(reaction);
        self
    }
}
