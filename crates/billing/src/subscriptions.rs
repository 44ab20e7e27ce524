//! Subscription state and the read-through subscription cache
//!
//! Several webhook events for one subscription typically arrive within
//! seconds of each other (checkout, first invoice, update). The cache keeps a
//! fetched subscription for a few minutes so that burst costs one Stripe call.
//! Entries are advisory: a miss fetches fresh and behaves exactly like a cold
//! start.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stripe::{Expandable, SubscriptionId};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Default time a fetched subscription stays cached.
pub const SUBSCRIPTION_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Upper bound on cached subscriptions; the oldest entry is evicted first.
const MAX_CACHE_ENTRIES: usize = 10_000;

/// Subscription lifecycle status, stored uppercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Trialing,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::PastDue => "PAST_DUE",
            SubscriptionStatus::Canceled => "CANCELED",
            SubscriptionStatus::Unpaid => "UNPAID",
            SubscriptionStatus::Trialing => "TRIALING",
            SubscriptionStatus::Incomplete => "INCOMPLETE",
            SubscriptionStatus::IncompleteExpired => "INCOMPLETE_EXPIRED",
            SubscriptionStatus::Paused => "PAUSED",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(SubscriptionStatus::Active),
            "PAST_DUE" => Ok(SubscriptionStatus::PastDue),
            "CANCELED" => Ok(SubscriptionStatus::Canceled),
            "UNPAID" => Ok(SubscriptionStatus::Unpaid),
            "TRIALING" => Ok(SubscriptionStatus::Trialing),
            "INCOMPLETE" => Ok(SubscriptionStatus::Incomplete),
            "INCOMPLETE_EXPIRED" => Ok(SubscriptionStatus::IncompleteExpired),
            "PAUSED" => Ok(SubscriptionStatus::Paused),
            other => Err(BillingError::InvalidInput(format!(
                "unknown subscription status: {other}"
            ))),
        }
    }
}

impl From<&stripe::SubscriptionStatus> for SubscriptionStatus {
    fn from(status: &stripe::SubscriptionStatus) -> Self {
        match status {
            stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
            stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
            stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
            stripe::SubscriptionStatus::Unpaid => SubscriptionStatus::Unpaid,
            stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
            stripe::SubscriptionStatus::Incomplete => SubscriptionStatus::Incomplete,
            stripe::SubscriptionStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
            stripe::SubscriptionStatus::Paused => SubscriptionStatus::Paused,
        }
    }
}

/// The parts of a Stripe subscription reconciliation needs.
///
/// Deserializes straight from a Stripe subscription object as found in
/// webhook `data.object`, for both the legacy layout (period end on the
/// subscription) and the current one (period end on each item).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawSubscription")]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub customer_id: String,
    pub price_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub metadata: HashMap<String, String>,
}

impl SubscriptionSnapshot {
    /// Organization id the checkout flow stamped onto the subscription.
    pub fn organization_hint(&self) -> Option<uuid::Uuid> {
        self.metadata
            .get("organizationId")
            .and_then(|id| uuid::Uuid::parse_str(id).ok())
    }
}

/// A Stripe id that may have been expanded into the full object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub(crate) enum ExpandableId {
    Id(String),
    Object { id: String },
}

impl ExpandableId {
    pub(crate) fn into_id(self) -> String {
        match self {
            ExpandableId::Id(id) | ExpandableId::Object { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct RawSubscription {
    id: String,
    customer: ExpandableId,
    status: SubscriptionStatus,
    #[serde(default)]
    items: RawItems,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    canceled_at: Option<i64>,
    #[serde(default, deserialize_with = "metadata")]
    metadata: HashMap<String, String>,
}

// Stripe sends `"metadata": null` on some objects.
pub(crate) fn metadata<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Default, Deserialize)]
struct RawItems {
    #[serde(default)]
    data: Vec<RawItem>,
}

#[derive(Deserialize)]
struct RawItem {
    #[serde(default)]
    price: Option<RawPrice>,
    #[serde(default)]
    current_period_end: Option<i64>,
}

#[derive(Deserialize)]
struct RawPrice {
    id: String,
}

fn timestamp(secs: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).ok()
}

impl From<RawSubscription> for SubscriptionSnapshot {
    fn from(raw: RawSubscription) -> Self {
        let first = raw.items.data.first();
        let period_end = raw
            .current_period_end
            .or_else(|| first.and_then(|item| item.current_period_end));

        Self {
            id: raw.id,
            customer_id: raw.customer.into_id(),
            price_id: first.and_then(|item| item.price.as_ref()).map(|p| p.id.clone()),
            status: raw.status,
            current_period_end: period_end.and_then(timestamp),
            cancel_at_period_end: raw.cancel_at_period_end,
            canceled_at: raw.canceled_at.and_then(timestamp),
            metadata: raw.metadata,
        }
    }
}

impl From<&stripe::Subscription> for SubscriptionSnapshot {
    fn from(subscription: &stripe::Subscription) -> Self {
        let customer_id = match &subscription.customer {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(customer) => customer.id.to_string(),
        };

        Self {
            id: subscription.id.to_string(),
            customer_id,
            price_id: subscription
                .items
                .data
                .first()
                .and_then(|item| item.price.as_ref())
                .map(|p| p.id.to_string()),
            status: SubscriptionStatus::from(&subscription.status),
            current_period_end: timestamp(subscription.current_period_end),
            cancel_at_period_end: subscription.cancel_at_period_end,
            canceled_at: subscription.canceled_at.and_then(timestamp),
            metadata: subscription.metadata.clone(),
        }
    }
}

/// Source of current subscription state.
#[async_trait]
pub trait SubscriptionFetcher: Send + Sync {
    async fn fetch(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot>;

    /// Forget anything remembered about `subscription_id`.
    async fn invalidate(&self, _subscription_id: &str) {}
}

/// Retrieves subscriptions from the Stripe API.
pub struct StripeSubscriptionFetcher {
    stripe: StripeClient,
}

impl StripeSubscriptionFetcher {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

#[async_trait]
impl SubscriptionFetcher for StripeSubscriptionFetcher {
    async fn fetch(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot> {
        let id = subscription_id.parse::<SubscriptionId>().map_err(|e| {
            BillingError::InvalidInput(format!("invalid subscription id {subscription_id}: {e}"))
        })?;

        let subscription = stripe::Subscription::retrieve(self.stripe.inner(), &id, &[]).await?;
        tracing::debug!(subscription_id = %subscription_id, "Fetched subscription from Stripe");
        Ok(SubscriptionSnapshot::from(&subscription))
    }
}

/// Read-through TTL cache in front of another fetcher.
pub struct CachedSubscriptionFetcher {
    inner: Arc<dyn SubscriptionFetcher>,
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedSubscription>>,
}

struct CachedSubscription {
    snapshot: SubscriptionSnapshot,
    fetched_at: Instant,
}

impl CachedSubscriptionFetcher {
    pub fn new(inner: Arc<dyn SubscriptionFetcher>) -> Self {
        Self::with_ttl(inner, SUBSCRIPTION_CACHE_TTL)
    }

    pub fn with_ttl(inner: Arc<dyn SubscriptionFetcher>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn prune_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SubscriptionFetcher for CachedSubscriptionFetcher {
    async fn fetch(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(subscription_id) {
                if entry.fetched_at.elapsed() < self.ttl {
                    tracing::debug!(subscription_id = %subscription_id, "Subscription cache hit");
                    return Ok(entry.snapshot.clone());
                }
            }
        }

        let snapshot = self.inner.fetch(subscription_id).await?;

        let mut entries = self.entries.write().await;
        if entries.len() >= MAX_CACHE_ENTRIES && !entries.contains_key(subscription_id) {
            let ttl = self.ttl;
            entries.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
            if entries.len() >= MAX_CACHE_ENTRIES {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.fetched_at)
                    .map(|(id, _)| id.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            subscription_id.to_string(),
            CachedSubscription {
                snapshot: snapshot.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(snapshot)
    }

    async fn invalidate(&self, subscription_id: &str) {
        self.entries.write().await.remove(subscription_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SubscriptionFetcher for CountingFetcher {
        async fn fetch(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::from_value(json!({
                "id": subscription_id,
                "customer": "cus_1",
                "status": "active",
                "items": {"data": [{"price": {"id": "price_pro"}}]},
                "current_period_end": 1_700_000_000
            }))
            .unwrap())
        }
    }

    #[test]
    fn parses_legacy_layout() {
        let snapshot: SubscriptionSnapshot = serde_json::from_value(json!({
            "id": "sub_1",
            "customer": {"id": "cus_1", "object": "customer"},
            "status": "past_due",
            "items": {"data": [{"price": {"id": "price_biz"}}]},
            "current_period_end": 1_700_000_000,
            "cancel_at_period_end": true,
            "metadata": {"organizationId": "7f0c2a8e-8d4a-4f61-9a55-3b1d2c4e5f60"}
        }))
        .unwrap();

        assert_eq!(snapshot.customer_id, "cus_1");
        assert_eq!(snapshot.price_id.as_deref(), Some("price_biz"));
        assert_eq!(snapshot.status, SubscriptionStatus::PastDue);
        assert_eq!(
            snapshot.current_period_end.map(|t| t.unix_timestamp()),
            Some(1_700_000_000)
        );
        assert!(snapshot.cancel_at_period_end);
        assert!(snapshot.organization_hint().is_some());
    }

    #[test]
    fn reads_period_end_from_items_when_absent_at_top_level() {
        let snapshot: SubscriptionSnapshot = serde_json::from_value(json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "active",
            "items": {"data": [{"price": {"id": "price_pro"}, "current_period_end": 1_800_000_000}]}
        }))
        .unwrap();
        assert_eq!(
            snapshot.current_period_end.map(|t| t.unix_timestamp()),
            Some(1_800_000_000)
        );
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::IncompleteExpired,
            SubscriptionStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
        }
        assert!("gone".parse::<SubscriptionStatus>().is_err());
    }

    #[tokio::test]
    async fn cache_serves_repeat_fetches_within_ttl() {
        let inner = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let cache = CachedSubscriptionFetcher::new(inner.clone());

        cache.fetch("sub_1").await.unwrap();
        cache.fetch("sub_1").await.unwrap();
        cache.fetch("sub_2").await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn expired_entries_are_fetched_again() {
        let inner = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let cache = CachedSubscriptionFetcher::with_ttl(inner.clone(), Duration::ZERO);

        cache.fetch("sub_1").await.unwrap();
        cache.fetch("sub_1").await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.prune_expired().await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_fetch() {
        let inner = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let cache = CachedSubscriptionFetcher::new(inner.clone());

        cache.fetch("sub_1").await.unwrap();
        cache.invalidate("sub_1").await;
        cache.fetch("sub_1").await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
