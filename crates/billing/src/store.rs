//! Billing persistence
//!
//! `subscriptions.plan` and the denormalized `organizations.plan` always move
//! together: every write that touches one touches the other in the same
//! transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use threadbase_shared::Plan;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionStatus;

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRecord {
    pub organization_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub stripe_price_id: String,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Organization owning the subscription with this Stripe id, if recorded.
    async fn organization_for_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Uuid>>;

    async fn organization_exists(&self, organization_id: Uuid) -> BillingResult<bool>;

    /// Upsert the organization's subscription and copy its plan onto the
    /// organization, atomically.
    async fn apply_subscription(&self, record: &SubscriptionRecord) -> BillingResult<()>;

    /// Move the period end forward on renewal. Returns `false` when no
    /// subscription with this id is recorded.
    async fn extend_period(
        &self,
        stripe_subscription_id: &str,
        period_end: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Mark the subscription canceled and drop the organization to the free
    /// plan, atomically.
    async fn cancel_subscription(
        &self,
        organization_id: Uuid,
        stripe_subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<()>;

    async fn subscription_for_organization(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>>;
}

pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type SubscriptionRow = (
    Uuid,
    String,
    String,
    String,
    String,
    String,
    Option<OffsetDateTime>,
    bool,
    Option<OffsetDateTime>,
);

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn organization_for_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT organization_id FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn organization_exists(&self, organization_id: Uuid) -> BillingResult<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM organizations WHERE id = $1")
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    async fn apply_subscription(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                organization_id, stripe_customer_id, stripe_subscription_id, stripe_price_id,
                plan, status, current_period_end, cancel_at_period_end, canceled_at,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (organization_id) DO UPDATE SET
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                stripe_price_id = EXCLUDED.stripe_price_id,
                plan = EXCLUDED.plan,
                status = EXCLUDED.status,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                updated_at = NOW()
            "#,
        )
        .bind(record.organization_id)
        .bind(&record.stripe_customer_id)
        .bind(&record.stripe_subscription_id)
        .bind(&record.stripe_price_id)
        .bind(record.plan.as_str())
        .bind(record.status.as_str())
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .bind(record.canceled_at)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query("UPDATE organizations SET plan = $1, updated_at = NOW() WHERE id = $2")
            .bind(record.plan.as_str())
            .bind(record.organization_id)
            .execute(&mut *tx)
            .await?;

        if updated.rows_affected() == 0 {
            // Rolls back on drop
            return Err(BillingError::InvalidInput(format!(
                "organization {} does not exist",
                record.organization_id
            )));
        }

        tx.commit().await?;

        tracing::info!(
            org_id = %record.organization_id,
            subscription_id = %record.stripe_subscription_id,
            plan = %record.plan,
            status = %record.status,
            "Subscription synced to database"
        );
        Ok(())
    }

    async fn extend_period(
        &self,
        stripe_subscription_id: &str,
        period_end: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET current_period_end = GREATEST(current_period_end, $2), updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(period_end)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_subscription(
        &self,
        organization_id: Uuid,
        stripe_subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'CANCELED', plan = 'FREE', canceled_at = $2,
                cancel_at_period_end = FALSE, updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(canceled_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE organizations SET plan = 'FREE', updated_at = NOW() WHERE id = $1")
            .bind(organization_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            org_id = %organization_id,
            subscription_id = %stripe_subscription_id,
            "Subscription canceled, downgraded to free plan"
        );
        Ok(())
    }

    async fn subscription_for_organization(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT organization_id, stripe_customer_id, stripe_subscription_id, stripe_price_id,
                   plan, status, current_period_end, cancel_at_period_end, canceled_at
            FROM subscriptions
            WHERE organization_id = $1
            "#,
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((org, customer, sub, price, plan, status, period_end, cancel_at_end, canceled)) =
            row
        else {
            return Ok(None);
        };

        Ok(Some(SubscriptionRecord {
            organization_id: org,
            stripe_customer_id: customer,
            stripe_subscription_id: sub,
            stripe_price_id: price,
            plan: plan
                .parse()
                .map_err(|e: threadbase_shared::UnknownPlan| BillingError::Internal(e.to_string()))?,
            status: status.parse()?,
            current_period_end: period_end,
            cancel_at_period_end: cancel_at_end,
            canceled_at: canceled,
        }))
    }
}

/// Process-local store with the same atomicity guarantees, for tests and
/// local development.
#[derive(Default)]
pub struct InMemoryBillingStore {
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    organizations: HashMap<Uuid, Plan>,
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_organization(&self, organization_id: Uuid) {
        self.inner
            .lock()
            .await
            .organizations
            .insert(organization_id, Plan::Free);
    }

    pub async fn organization_plan(&self, organization_id: Uuid) -> Option<Plan> {
        self.inner
            .lock()
            .await
            .organizations
            .get(&organization_id)
            .copied()
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn organization_for_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        let state = self.inner.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.stripe_subscription_id == stripe_subscription_id)
            .map(|s| s.organization_id))
    }

    async fn organization_exists(&self, organization_id: Uuid) -> BillingResult<bool> {
        Ok(self
            .inner
            .lock()
            .await
            .organizations
            .contains_key(&organization_id))
    }

    async fn apply_subscription(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        let mut state = self.inner.lock().await;
        let Some(plan) = state.organizations.get_mut(&record.organization_id) else {
            return Err(BillingError::InvalidInput(format!(
                "organization {} does not exist",
                record.organization_id
            )));
        };
        *plan = record.plan;
        state
            .subscriptions
            .insert(record.organization_id, record.clone());
        Ok(())
    }

    async fn extend_period(
        &self,
        stripe_subscription_id: &str,
        period_end: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.inner.lock().await;
        let Some(subscription) = state
            .subscriptions
            .values_mut()
            .find(|s| s.stripe_subscription_id == stripe_subscription_id)
        else {
            return Ok(false);
        };
        subscription.current_period_end = Some(
            subscription
                .current_period_end
                .map_or(period_end, |current| current.max(period_end)),
        );
        Ok(true)
    }

    async fn cancel_subscription(
        &self,
        organization_id: Uuid,
        stripe_subscription_id: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut state = self.inner.lock().await;
        if let Some(subscription) = state
            .subscriptions
            .values_mut()
            .find(|s| s.stripe_subscription_id == stripe_subscription_id)
        {
            subscription.status = SubscriptionStatus::Canceled;
            subscription.plan = Plan::Free;
            subscription.canceled_at = Some(canceled_at);
            subscription.cancel_at_period_end = false;
        }
        if let Some(plan) = state.organizations.get_mut(&organization_id) {
            *plan = Plan::Free;
        }
        Ok(())
    }

    async fn subscription_for_organization(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .subscriptions
            .get(&organization_id)
            .cloned())
    }
}
