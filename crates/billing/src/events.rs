//! Stripe events the billing worker understands
//!
//! Raw webhook JSON is parsed into [`BillingEvent`] once, at the top of the
//! worker, so dispatch is an exhaustive match instead of a string switch.

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{metadata, ExpandableId, SubscriptionSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    /// `checkout.session.completed`
    CheckoutSessionCompleted(CheckoutSession),
    /// `invoice.payment_succeeded`
    InvoicePaymentSucceeded(PaidInvoice),
    /// `customer.subscription.updated`
    SubscriptionUpdated(SubscriptionSnapshot),
    /// `customer.subscription.deleted`
    SubscriptionDeleted(SubscriptionSnapshot),
    /// Any event type without a handler.
    Unhandled { event_type: String },
}

impl BillingEvent {
    /// Parse the `data.object` of a raw Stripe event according to its type.
    pub fn parse(event_type: &str, raw_event: &serde_json::Value) -> BillingResult<Self> {
        match event_type {
            "checkout.session.completed" => Ok(BillingEvent::CheckoutSessionCompleted(
                data_object(event_type, raw_event)?,
            )),
            "invoice.payment_succeeded" => Ok(BillingEvent::InvoicePaymentSucceeded(
                data_object(event_type, raw_event)?,
            )),
            "customer.subscription.updated" => Ok(BillingEvent::SubscriptionUpdated(
                data_object(event_type, raw_event)?,
            )),
            "customer.subscription.deleted" => Ok(BillingEvent::SubscriptionDeleted(
                data_object(event_type, raw_event)?,
            )),
            other => Ok(BillingEvent::Unhandled {
                event_type: other.to_string(),
            }),
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            BillingEvent::CheckoutSessionCompleted(_) => "checkout.session.completed",
            BillingEvent::InvoicePaymentSucceeded(_) => "invoice.payment_succeeded",
            BillingEvent::SubscriptionUpdated(_) => "customer.subscription.updated",
            BillingEvent::SubscriptionDeleted(_) => "customer.subscription.deleted",
            BillingEvent::Unhandled { event_type } => event_type,
        }
    }
}

fn data_object<T: serde::de::DeserializeOwned>(
    event_type: &str,
    raw_event: &serde_json::Value,
) -> BillingResult<T> {
    let object = raw_event.pointer("/data/object").ok_or_else(|| {
        BillingError::InvalidInput(format!("{event_type} event has no data.object"))
    })?;
    T::deserialize(object).map_err(|e| {
        BillingError::WebhookEventNotSupported(format!("unexpected {event_type} payload: {e}"))
    })
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, deserialize_with = "optional_id")]
    pub subscription: Option<String>,
    #[serde(default, deserialize_with = "optional_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default, deserialize_with = "metadata")]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
    /// The organization that started checkout: `metadata.organizationId`,
    /// else the session's `client_reference_id`.
    pub fn organization_id(&self) -> BillingResult<Uuid> {
        let raw = self
            .metadata
            .get("organizationId")
            .or(self.client_reference_id.as_ref())
            .ok_or_else(|| {
                BillingError::InvalidInput(format!(
                    "checkout session {} carries no organization id",
                    self.id
                ))
            })?;
        Uuid::parse_str(raw).map_err(|e| {
            BillingError::InvalidInput(format!("invalid organization id {raw:?}: {e}"))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PaidInvoice {
    pub id: String,
    #[serde(default, deserialize_with = "optional_id")]
    subscription: Option<String>,
    /// Newer API versions move the subscription under `parent`.
    #[serde(default)]
    parent: Option<InvoiceParent>,
    #[serde(default)]
    lines: InvoiceLines,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct InvoiceParent {
    #[serde(default)]
    subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct SubscriptionDetails {
    #[serde(default, deserialize_with = "optional_id")]
    subscription: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct InvoiceLines {
    #[serde(default)]
    data: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct InvoiceLine {
    #[serde(default)]
    period: Option<Period>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Period {
    end: i64,
}

impl PaidInvoice {
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_deref().or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| d.subscription.as_deref())
        })
    }

    /// Latest service period end across the invoice lines.
    pub fn period_end(&self) -> Option<OffsetDateTime> {
        self.lines
            .data
            .iter()
            .filter_map(|line| line.period.as_ref())
            .map(|period| period.end)
            .max()
            .and_then(|end| OffsetDateTime::from_unix_timestamp(end).ok())
    }
}

fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<ExpandableId>::deserialize(deserializer)?.map(ExpandableId::into_id))
}
