// Billing crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Threadbase Billing Module
//!
//! Stripe webhook pipeline: verify, enqueue, reconcile.
//!
//! ## Features
//!
//! - **Verification**: Stripe SDK verification with a manual HMAC fallback for newer API versions
//! - **Jobs**: Verified events are queued keyed by event id, so redelivery is a no-op
//! - **Reconciliation**: Checkout, renewal, plan change and cancellation update the
//!   subscription and the organization's plan in one transaction
//! - **Caching**: Stripe subscription lookups are cached for five minutes

pub mod client;
pub mod error;
pub mod events;
pub mod job;
pub mod store;
pub mod subscriptions;
pub mod verify;
pub mod worker;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEvent, CheckoutSession, PaidInvoice};

// Jobs
pub use job::{BillingWebhookJob, BILLING_QUEUE};

// Store
pub use store::{BillingStore, InMemoryBillingStore, PgBillingStore, SubscriptionRecord};

// Subscriptions
pub use subscriptions::{
    CachedSubscriptionFetcher, StripeSubscriptionFetcher, SubscriptionFetcher,
    SubscriptionSnapshot, SubscriptionStatus, SUBSCRIPTION_CACHE_TTL,
};

// Verification
pub use verify::{StripeWebhookVerifier, VerifiedEvent, SIGNATURE_TOLERANCE_SECS};

// Worker
pub use worker::BillingWorker;
