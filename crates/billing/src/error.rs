//! Billing error types

use thiserror::Error;
use threadbase_shared::QueueError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    /// Carries the verifier's reason. Never includes the webhook secret.
    #[error("Webhook signature verification failed: {0}")]
    WebhookSignatureInvalid(String),

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("No plan is configured for Stripe price {0}")]
    UnknownPrice(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Billing configuration error: {0}")]
    Config(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether a webhook job failing with this error should be attempted again.
    ///
    /// Infrastructure failures are transient. A missing subscription usually
    /// means the checkout event that creates it has not been processed yet.
    /// Everything derived from the event body itself will fail the same way
    /// on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Database(_)
            | BillingError::StripeApi(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::Queue(_)
            | BillingError::Internal(_) => true,
            BillingError::WebhookSignatureInvalid(_)
            | BillingError::WebhookEventNotSupported(_)
            | BillingError::UnknownPrice(_)
            | BillingError::InvalidInput(_)
            | BillingError::Config(_) => false,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}
