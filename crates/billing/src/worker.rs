//! Billing webhook worker
//!
//! Reconciles subscription state from verified Stripe events. Redelivered
//! events never reach this point: the queue drops duplicate event ids at
//! enqueue time.

use std::sync::Arc;

use async_trait::async_trait;
use threadbase_shared::{JobAttempt, JobEnvelope, JobError, JobHandler, Plan};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::PriceIds;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, CheckoutSession, PaidInvoice};
use crate::job::BillingWebhookJob;
use crate::store::{BillingStore, SubscriptionRecord};
use crate::subscriptions::{SubscriptionFetcher, SubscriptionSnapshot, SubscriptionStatus};

pub struct BillingWorker {
    store: Arc<dyn BillingStore>,
    subscriptions: Arc<dyn SubscriptionFetcher>,
    prices: PriceIds,
}

impl BillingWorker {
    pub fn new(
        store: Arc<dyn BillingStore>,
        subscriptions: Arc<dyn SubscriptionFetcher>,
        prices: PriceIds,
    ) -> Self {
        Self {
            store,
            subscriptions,
            prices,
        }
    }

    /// Apply one webhook job.
    pub async fn process(&self, job: &BillingWebhookJob) -> BillingResult<()> {
        let event = BillingEvent::parse(&job.event_type, &job.raw_event_data)?;

        tracing::info!(
            event_id = %job.event_id,
            event_type = %event.event_type(),
            "Processing Stripe webhook event"
        );

        match event {
            BillingEvent::CheckoutSessionCompleted(session) => {
                self.handle_checkout_completed(&job.event_id, session).await
            }
            BillingEvent::InvoicePaymentSucceeded(invoice) => {
                self.handle_invoice_payment_succeeded(&job.event_id, invoice)
                    .await
            }
            BillingEvent::SubscriptionUpdated(subscription) => {
                self.handle_subscription_updated(&job.event_id, subscription)
                    .await
            }
            BillingEvent::SubscriptionDeleted(subscription) => {
                self.handle_subscription_deleted(&job.event_id, subscription)
                    .await
            }
            BillingEvent::Unhandled { event_type } => {
                tracing::info!(
                    event_type = %event_type,
                    event_id = %job.event_id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(())
            }
        }
    }

    async fn handle_checkout_completed(
        &self,
        event_id: &str,
        session: CheckoutSession,
    ) -> BillingResult<()> {
        let Some(subscription_id) = session.subscription.as_deref() else {
            tracing::info!(
                event_id = %event_id,
                session_id = %session.id,
                mode = ?session.mode,
                "Checkout session has no subscription, nothing to reconcile"
            );
            return Ok(());
        };

        let org_id = session.organization_id()?;
        if !self.store.organization_exists(org_id).await? {
            return Err(BillingError::InvalidInput(format!(
                "checkout session {} references unknown organization {org_id}",
                session.id
            )));
        }

        let subscription = self.subscriptions.fetch(subscription_id).await?;
        let record = self.record_for(org_id, &subscription)?;
        self.store.apply_subscription(&record).await?;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription_id,
            plan = %record.plan,
            "Checkout completed, subscription activated"
        );
        Ok(())
    }

    async fn handle_invoice_payment_succeeded(
        &self,
        event_id: &str,
        invoice: PaidInvoice,
    ) -> BillingResult<()> {
        let Some(subscription_id) = invoice.subscription_id() else {
            tracing::debug!(
                event_id = %event_id,
                invoice_id = %invoice.id,
                "Invoice is not tied to a subscription, skipping"
            );
            return Ok(());
        };

        let period_end = match invoice.period_end() {
            Some(end) => end,
            None => self
                .subscriptions
                .fetch(subscription_id)
                .await?
                .current_period_end
                .ok_or_else(|| {
                    BillingError::InvalidInput(format!(
                        "subscription {subscription_id} has no current period end"
                    ))
                })?,
        };

        if !self.store.extend_period(subscription_id, period_end).await? {
            // Checkout for this subscription may not have been processed yet
            return Err(BillingError::SubscriptionNotFound(subscription_id.to_string()));
        }

        tracing::info!(
            subscription_id = %subscription_id,
            invoice_id = %invoice.id,
            period_end = %period_end,
            "Subscription renewed"
        );
        Ok(())
    }

    async fn handle_subscription_updated(
        &self,
        event_id: &str,
        subscription: SubscriptionSnapshot,
    ) -> BillingResult<()> {
        self.subscriptions.invalidate(&subscription.id).await;

        let org_id = self.resolve_organization(&subscription).await?;
        let record = self.record_for(org_id, &subscription)?;
        self.store.apply_subscription(&record).await?;

        if record.status == SubscriptionStatus::PastDue {
            tracing::warn!(
                org_id = %org_id,
                subscription_id = %subscription.id,
                "Subscription is past due"
            );
        }

        tracing::info!(
            event_id = %event_id,
            org_id = %org_id,
            subscription_id = %subscription.id,
            plan = %record.plan,
            status = %record.status,
            "Subscription updated"
        );
        Ok(())
    }

    async fn handle_subscription_deleted(
        &self,
        event_id: &str,
        subscription: SubscriptionSnapshot,
    ) -> BillingResult<()> {
        self.subscriptions.invalidate(&subscription.id).await;

        let org_id = self.resolve_organization(&subscription).await?;
        let canceled_at = subscription
            .canceled_at
            .unwrap_or_else(OffsetDateTime::now_utc);

        self.store
            .cancel_subscription(org_id, &subscription.id, canceled_at)
            .await?;

        tracing::info!(
            event_id = %event_id,
            org_id = %org_id,
            subscription_id = %subscription.id,
            "Subscription cancelled, downgraded to free plan"
        );
        Ok(())
    }

    /// The recorded owner of the subscription, else the organization id the
    /// checkout flow put in the subscription metadata.
    async fn resolve_organization(&self, subscription: &SubscriptionSnapshot) -> BillingResult<Uuid> {
        if let Some(org_id) = self
            .store
            .organization_for_subscription(&subscription.id)
            .await?
        {
            return Ok(org_id);
        }

        if let Some(org_id) = subscription.organization_hint() {
            if self.store.organization_exists(org_id).await? {
                return Ok(org_id);
            }
        }
        Err(BillingError::SubscriptionNotFound(subscription.id.clone()))
    }

    fn record_for(
        &self,
        org_id: Uuid,
        subscription: &SubscriptionSnapshot,
    ) -> BillingResult<SubscriptionRecord> {
        let price_id = subscription.price_id.clone().ok_or_else(|| {
            BillingError::InvalidInput(format!("subscription {} has no price", subscription.id))
        })?;
        let plan: Plan = self
            .prices
            .plan_for(&price_id)
            .ok_or_else(|| BillingError::UnknownPrice(price_id.clone()))?;

        Ok(SubscriptionRecord {
            organization_id: org_id,
            stripe_customer_id: subscription.customer_id.clone(),
            stripe_subscription_id: subscription.id.clone(),
            stripe_price_id: price_id,
            plan,
            status: subscription.status,
            current_period_end: subscription.current_period_end,
            cancel_at_period_end: subscription.cancel_at_period_end,
            canceled_at: subscription.canceled_at,
        })
    }
}

#[async_trait]
impl JobHandler for BillingWorker {
    fn name(&self) -> &'static str {
        "billing-webhook"
    }

    async fn handle(&self, job: &JobEnvelope, attempt: JobAttempt) -> Result<(), JobError> {
        let webhook: BillingWebhookJob = job
            .decode()
            .map_err(|e| JobError::Permanent(format!("malformed billing job: {e}")))?;

        self.process(&webhook).await.map_err(|e| {
            tracing::error!(
                event_id = %webhook.event_id,
                event_type = %webhook.event_type,
                attempt = attempt.number,
                error = %e,
                "Failed to process Stripe webhook event"
            );
            if e.is_retryable() {
                JobError::Retryable(e.to_string())
            } else {
                JobError::Permanent(e.to_string())
            }
        })
    }
}
