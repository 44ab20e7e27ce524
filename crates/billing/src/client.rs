//! Stripe client and configuration

use std::fmt;

use stripe::Client;
use threadbase_shared::Plan;

use crate::error::{BillingError, BillingResult};

/// Stripe price ids for each paid plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceIds {
    pub pro: Option<String>,
    pub business: Option<String>,
    pub enterprise: Option<String>,
}

impl PriceIds {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            pro: var("STRIPE_PRICE_PRO"),
            business: var("STRIPE_PRICE_BUSINESS"),
            enterprise: var("STRIPE_PRICE_ENTERPRISE"),
        }
    }

    /// Map a Stripe price id to the plan it sells.
    pub fn plan_for(&self, price_id: &str) -> Option<Plan> {
        [
            (&self.pro, Plan::Pro),
            (&self.business, Plan::Business),
            (&self.enterprise, Plan::Enterprise),
        ]
        .into_iter()
        .find_map(|(configured, plan)| (configured.as_deref() == Some(price_id)).then_some(plan))
    }
}

#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub prices: PriceIds,
}

// Secrets stay out of logs.
impl fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"[redacted]")
            .field("webhook_secret", &"[redacted]")
            .field("prices", &self.prices)
            .finish()
    }
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        Ok(Self {
            secret_key,
            webhook_secret,
            prices: PriceIds::from_env(),
        })
    }
}

/// Thin wrapper that keeps the SDK client and its configuration together.
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
