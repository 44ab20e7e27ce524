//! Billing webhook job payload

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::verify::VerifiedEvent;

/// Queue name for verified Stripe webhooks.
pub const BILLING_QUEUE: &str = "billing-webhooks";

/// A verified Stripe event waiting to be reconciled. The queue job id is the
/// Stripe event id, so a redelivered webhook is dropped at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingWebhookJob {
    pub event_id: String,
    pub event_type: String,
    pub raw_event_data: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
}

impl BillingWebhookJob {
    pub fn job_id(&self) -> &str {
        &self.event_id
    }
}

impl From<VerifiedEvent> for BillingWebhookJob {
    fn from(event: VerifiedEvent) -> Self {
        Self {
            event_id: event.id,
            event_type: event.event_type,
            raw_event_data: event.payload,
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_camel_case_fields() {
        let job = BillingWebhookJob::from(VerifiedEvent {
            id: "evt_1".into(),
            event_type: "invoice.payment_succeeded".into(),
            created: 0,
            payload: serde_json::json!({"id": "evt_1"}),
        });
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["eventId"], "evt_1");
        assert_eq!(json["eventType"], "invoice.payment_succeeded");
        assert_eq!(json["rawEventData"]["id"], "evt_1");
        assert!(json["enqueuedAt"].is_string());
        assert_eq!(job.job_id(), "evt_1");
    }
}
