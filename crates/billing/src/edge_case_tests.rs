// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Pipeline
//!
//! Exercises the worker end to end against the in-memory store:
//! - Plan reconciliation (checkout, update, cancellation)
//! - Renewal ordering and missing subscriptions
//! - Retry classification of failures
//! - Queue-level deduplication of redelivered events
//! - Subscription cache usage across related events

#[cfg(test)]
mod worker_tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use threadbase_shared::{
        enqueue_job, JobQueue, MemoryQueue, Plan, QueueConsumer, RetryPolicy,
    };
    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::client::PriceIds;
    use crate::error::{BillingError, BillingResult};
    use crate::job::BillingWebhookJob;
    use crate::store::{BillingStore, InMemoryBillingStore};
    use crate::subscriptions::{
        CachedSubscriptionFetcher, SubscriptionFetcher, SubscriptionSnapshot, SubscriptionStatus,
    };
    use crate::worker::BillingWorker;

    const PERIOD_END: i64 = 1_700_000_000;

    struct StubStripe {
        subscriptions: HashMap<String, serde_json::Value>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SubscriptionFetcher for StubStripe {
        async fn fetch(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let raw = self
                .subscriptions
                .get(subscription_id)
                .cloned()
                .ok_or_else(|| BillingError::StripeApi("No such subscription".into()))?;
            Ok(serde_json::from_value(raw).unwrap())
        }
    }

    fn subscription_object(id: &str, price: &str, status: &str, org: Option<Uuid>) -> serde_json::Value {
        let metadata = org
            .map(|org| json!({"organizationId": org.to_string()}))
            .unwrap_or_else(|| json!({}));
        json!({
            "id": id,
            "object": "subscription",
            "customer": "cus_1",
            "status": status,
            "items": {"data": [{"price": {"id": price}}]},
            "current_period_end": PERIOD_END,
            "cancel_at_period_end": false,
            "metadata": metadata
        })
    }

    fn prices() -> PriceIds {
        PriceIds {
            pro: Some("price_pro".into()),
            business: Some("price_business".into()),
            enterprise: Some("price_enterprise".into()),
        }
    }

    fn job(event_id: &str, event_type: &str, object: serde_json::Value) -> BillingWebhookJob {
        BillingWebhookJob {
            event_id: event_id.into(),
            event_type: event_type.into(),
            raw_event_data: json!({
                "id": event_id,
                "type": event_type,
                "data": {"object": object}
            }),
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }

    struct Harness {
        store: Arc<InMemoryBillingStore>,
        stripe: Arc<StubStripe>,
        worker: Arc<BillingWorker>,
        org: Uuid,
    }

    async fn harness() -> Harness {
        let org = Uuid::new_v4();
        let store = Arc::new(InMemoryBillingStore::new());
        store.add_organization(org).await;

        let stripe = Arc::new(StubStripe {
            subscriptions: HashMap::from([(
                "sub_1".to_string(),
                subscription_object("sub_1", "price_pro", "active", Some(org)),
            )]),
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(CachedSubscriptionFetcher::new(stripe.clone()));
        let worker = Arc::new(BillingWorker::new(store.clone(), cache, prices()));

        Harness {
            store,
            stripe,
            worker,
            org,
        }
    }

    fn checkout(h: &Harness) -> BillingWebhookJob {
        job(
            "evt_checkout",
            "checkout.session.completed",
            json!({
                "id": "cs_1",
                "mode": "subscription",
                "subscription": "sub_1",
                "customer": "cus_1",
                "metadata": {"organizationId": h.org.to_string()}
            }),
        )
    }

    #[tokio::test]
    async fn checkout_activates_plan_on_subscription_and_organization() {
        let h = harness().await;
        h.worker.process(&checkout(&h)).await.unwrap();

        let sub = h.store.subscription_for_organization(h.org).await.unwrap().unwrap();
        assert_eq!(sub.plan, Plan::Pro);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.stripe_subscription_id, "sub_1");
        assert_eq!(
            sub.current_period_end.map(|t| t.unix_timestamp()),
            Some(PERIOD_END)
        );
        assert_eq!(h.store.organization_plan(h.org).await, Some(Plan::Pro));
    }

    #[tokio::test]
    async fn subscription_update_moves_both_plans_to_business() {
        let h = harness().await;
        h.worker.process(&checkout(&h)).await.unwrap();

        let update = job(
            "evt_update",
            "customer.subscription.updated",
            subscription_object("sub_1", "price_business", "active", None),
        );
        h.worker.process(&update).await.unwrap();

        let sub = h.store.subscription_for_organization(h.org).await.unwrap().unwrap();
        assert_eq!(sub.plan, Plan::Business);
        assert_eq!(h.store.organization_plan(h.org).await, Some(Plan::Business));
    }

    #[tokio::test]
    async fn subscription_update_falls_back_to_metadata_organization() {
        let h = harness().await;
        let update = job(
            "evt_update",
            "customer.subscription.updated",
            subscription_object("sub_new", "price_enterprise", "trialing", Some(h.org)),
        );
        h.worker.process(&update).await.unwrap();

        let sub = h.store.subscription_for_organization(h.org).await.unwrap().unwrap();
        assert_eq!(sub.plan, Plan::Enterprise);
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
    }

    #[tokio::test]
    async fn subscription_update_for_unknown_organization_is_retryable() {
        let h = harness().await;
        let update = job(
            "evt_update",
            "customer.subscription.updated",
            subscription_object("sub_orphan", "price_pro", "active", None),
        );
        let err = h.worker.process(&update).await.unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionNotFound(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn deletion_cancels_and_resets_to_free() {
        let h = harness().await;
        h.worker.process(&checkout(&h)).await.unwrap();

        let mut object = subscription_object("sub_1", "price_pro", "canceled", None);
        object["canceled_at"] = json!(PERIOD_END + 10);
        h.worker
            .process(&job("evt_delete", "customer.subscription.deleted", object))
            .await
            .unwrap();

        let sub = h.store.subscription_for_organization(h.org).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert!(sub.canceled_at.is_some());
        assert_eq!(h.store.organization_plan(h.org).await, Some(Plan::Free));
    }

    #[tokio::test]
    async fn deletion_without_timestamp_uses_now() {
        let h = harness().await;
        h.worker.process(&checkout(&h)).await.unwrap();

        let object = subscription_object("sub_1", "price_pro", "canceled", None);
        h.worker
            .process(&job("evt_delete", "customer.subscription.deleted", object))
            .await
            .unwrap();

        let sub = h.store.subscription_for_organization(h.org).await.unwrap().unwrap();
        assert!(sub.canceled_at.is_some());
    }

    #[tokio::test]
    async fn invoice_extends_period_without_changing_plan() {
        let h = harness().await;
        h.worker.process(&checkout(&h)).await.unwrap();

        let renewal = job(
            "evt_invoice",
            "invoice.payment_succeeded",
            json!({
                "id": "in_1",
                "subscription": "sub_1",
                "lines": {"data": [{"period": {"start": PERIOD_END, "end": PERIOD_END + 2_592_000}}]}
            }),
        );
        h.worker.process(&renewal).await.unwrap();

        let sub = h.store.subscription_for_organization(h.org).await.unwrap().unwrap();
        assert_eq!(
            sub.current_period_end.map(|t| t.unix_timestamp()),
            Some(PERIOD_END + 2_592_000)
        );
        assert_eq!(sub.plan, Plan::Pro);
    }

    #[tokio::test]
    async fn late_invoice_never_moves_period_backwards() {
        let h = harness().await;
        h.worker.process(&checkout(&h)).await.unwrap();

        let stale = job(
            "evt_invoice_old",
            "invoice.payment_succeeded",
            json!({
                "id": "in_0",
                "subscription": "sub_1",
                "lines": {"data": [{"period": {"start": 0, "end": PERIOD_END - 100}}]}
            }),
        );
        h.worker.process(&stale).await.unwrap();

        let sub = h.store.subscription_for_organization(h.org).await.unwrap().unwrap();
        assert_eq!(
            sub.current_period_end.map(|t| t.unix_timestamp()),
            Some(PERIOD_END)
        );
    }

    #[tokio::test]
    async fn invoice_before_checkout_is_retryable() {
        let h = harness().await;
        let renewal = job(
            "evt_invoice",
            "invoice.payment_succeeded",
            json!({"id": "in_1", "subscription": "sub_1", "lines": {"data": []}}),
        );
        let err = h.worker.process(&renewal).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn invoice_without_subscription_is_a_no_op() {
        let h = harness().await;
        let one_off = job(
            "evt_invoice",
            "invoice.payment_succeeded",
            json!({"id": "in_1", "subscription": null}),
        );
        h.worker.process(&one_off).await.unwrap();
        assert_eq!(h.stripe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_price_is_permanent() {
        let h = harness().await;
        h.worker.process(&checkout(&h)).await.unwrap();

        let update = job(
            "evt_update",
            "customer.subscription.updated",
            subscription_object("sub_1", "price_legacy", "active", None),
        );
        let err = h.worker.process(&update).await.unwrap_err();
        assert!(matches!(err, BillingError::UnknownPrice(_)));
        assert!(!err.is_retryable());

        // Nothing was half-applied
        assert_eq!(h.store.organization_plan(h.org).await, Some(Plan::Pro));
    }

    #[tokio::test]
    async fn checkout_for_missing_organization_is_permanent() {
        let h = harness().await;
        let session = job(
            "evt_checkout",
            "checkout.session.completed",
            json!({
                "id": "cs_1",
                "subscription": "sub_1",
                "client_reference_id": Uuid::new_v4().to_string()
            }),
        );
        let err = h.worker.process(&session).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unhandled_event_types_succeed() {
        let h = harness().await;
        h.worker
            .process(&job("evt_x", "charge.refunded", json!({"id": "ch_1"})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn checkout_and_renewal_share_one_stripe_fetch() {
        let h = harness().await;
        h.worker.process(&checkout(&h)).await.unwrap();

        // No line period, so the worker reads the cached subscription
        let renewal = job(
            "evt_invoice",
            "invoice.payment_succeeded",
            json!({"id": "in_1", "subscription": "sub_1"}),
        );
        h.worker.process(&renewal).await.unwrap();

        assert_eq!(h.stripe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn redelivered_event_is_processed_once() {
        let h = harness().await;
        let queue = Arc::new(MemoryQueue::new("billing", RetryPolicy::billing()));
        let consumer = QueueConsumer::new(queue.clone(), h.worker.clone());

        let event = checkout(&h);
        enqueue_job(queue.as_ref(), Some(event.job_id()), &event)
            .await
            .unwrap();
        enqueue_job(queue.as_ref(), Some(event.job_id()), &event)
            .await
            .unwrap();

        assert_eq!(consumer.drain().await.unwrap(), 1);
        assert_eq!(h.stripe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.counts().await.unwrap().failed, 0);
    }

    #[tokio::test]
    async fn permanent_failure_is_parked_for_inspection() {
        let h = harness().await;
        let queue = Arc::new(MemoryQueue::new("billing", RetryPolicy::billing()));
        let consumer = QueueConsumer::new(queue.clone(), h.worker.clone());

        let bad = job(
            "evt_bad",
            "customer.subscription.updated",
            json!({"id": "sub_1", "status": "not-a-status", "customer": "cus_1"}),
        );
        enqueue_job(queue.as_ref(), Some("evt_bad"), &bad).await.unwrap();
        consumer.drain().await.unwrap();

        let failed = queue.failed_jobs(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job.id, "evt_bad");
        assert_eq!(failed[0].job.attempts, 1);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_parked() {
        let h = harness().await;
        let queue = Arc::new(MemoryQueue::new("billing", RetryPolicy::billing()));
        let consumer = QueueConsumer::new(queue.clone(), h.worker.clone());

        let session = job(
            "evt_checkout",
            "checkout.session.completed",
            json!({
                "id": "cs_1",
                "subscription": "sub_missing",
                "metadata": {"organizationId": h.org.to_string()}
            }),
        );
        enqueue_job(queue.as_ref(), Some("evt_checkout"), &session)
            .await
            .unwrap();

        for _ in 0..3 {
            consumer.drain().await.unwrap();
            queue.release_delayed().await;
        }

        assert_eq!(h.stripe.calls.load(Ordering::SeqCst), 3);
        let failed = queue.failed_jobs(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job.attempts, 3);
    }
}
