//! API error responses

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use threadbase_archival::SignatureRejection;
use threadbase_shared::{QueueError, RateLimitResult};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing or invalid ingress secret")]
    Unauthorized,

    #[error("Rate limit exceeded")]
    RateLimited(RateLimitResult),

    /// Stripe signature failure. The body carries the verifier's reason.
    #[error("Webhook Error: {0}")]
    WebhookSignature(String),

    #[error("Request signature rejected: {0}")]
    SignatureRejected(#[from] SignatureRejection),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("Failed to enqueue job: {0}")]
    Queue(#[from] QueueError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::RateLimited(result) => return rate_limited_response(result),
            ApiError::WebhookSignature(_) => {
                return (StatusCode::BAD_REQUEST, self.to_string()).into_response();
            }
            ApiError::SignatureRejected(reason) => {
                (StatusCode::UNAUTHORIZED, format!("Invalid request signature: {reason}"))
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::NotConfigured(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ApiError::Queue(e) => {
                tracing::error!(error = %e, "Failed to enqueue job");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to enqueue job".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

fn rate_limited_response(result: &RateLimitResult) -> Response {
    let body = Json(json!({
        "error": "Too many requests",
        "code": StatusCode::TOO_MANY_REQUESTS.as_u16(),
        "limit": result.limit,
        "remaining": result.remaining,
        "reset": result.reset_at.unix_timestamp(),
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", HeaderValue::from(result.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(result.remaining));
    headers.insert(
        "X-RateLimit-Reset",
        HeaderValue::from(result.reset_at.unix_timestamp()),
    );
    headers.insert("Retry-After", HeaderValue::from(result.retry_after_seconds));
    response
}
