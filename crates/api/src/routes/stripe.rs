//! Stripe webhook ingress
//!
//! Rate limit by client IP, verify the signature, enqueue keyed by event id.
//! Reconciliation happens in the worker.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use threadbase_billing::{BillingError, BillingWebhookJob};
use threadbase_shared::{enqueue_job, EnqueueOutcome};

use crate::error::{ApiError, ApiResult};
use crate::routes::{extract_client_ip, header_str};
use crate::state::AppState;

/// POST /api/webhooks/stripe
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let client_ip = extract_client_ip(&headers).unwrap_or_else(|| "unknown".to_string());

    match state.rate_limiter.check(&format!("stripe:{client_ip}")).await {
        Ok(result) if !result.allowed => {
            tracing::warn!(
                client_ip = %client_ip,
                retry_after_seconds = result.retry_after_seconds,
                "Stripe webhook rate limit exceeded"
            );
            return Err(ApiError::RateLimited(result));
        }
        Ok(_) => {}
        Err(e) => {
            // Fail-open: a limiter outage must not drop billing events
            tracing::error!(
                client_ip = %client_ip,
                error = %e,
                "Rate limit check failed, allowing request"
            );
        }
    }

    let Some(verifier) = state.stripe_verifier.as_ref() else {
        return Err(ApiError::NotConfigured("Stripe webhook verification"));
    };

    let Some(signature) = header_str(&headers, "Stripe-Signature") else {
        tracing::warn!(client_ip = %client_ip, "Stripe webhook without signature header");
        return Err(ApiError::WebhookSignature(
            "missing Stripe-Signature header".to_string(),
        ));
    };

    let payload = std::str::from_utf8(&body)
        .map_err(|_| ApiError::WebhookSignature("payload is not valid UTF-8".to_string()))?;

    let event = verifier.verify(payload, signature).map_err(|e| match e {
        BillingError::WebhookSignatureInvalid(reason) => ApiError::WebhookSignature(reason),
        other => ApiError::WebhookSignature(other.to_string()),
    })?;

    let job = BillingWebhookJob::from(event);
    let outcome = enqueue_job(state.billing_queue.as_ref(), Some(job.job_id()), &job).await?;

    match outcome {
        EnqueueOutcome::Enqueued => tracing::info!(
            event_id = %job.event_id,
            event_type = %job.event_type,
            "Stripe webhook enqueued"
        ),
        EnqueueOutcome::Duplicate => tracing::info!(
            event_id = %job.event_id,
            event_type = %job.event_type,
            "Duplicate Stripe webhook ignored"
        ),
    }

    Ok(StatusCode::OK)
}
