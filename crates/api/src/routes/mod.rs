//! HTTP routes

pub mod archive;
pub mod discord;
pub mod health;
pub mod slack;
pub mod stripe;

use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/archive", post(archive::archive))
        .route("/api/webhooks/stripe", post(stripe::stripe_webhook))
        .route("/api/slack/events", post(slack::slack_events))
        .route("/api/discord/interactions", post(discord::discord_interactions))
        .with_state(state)
}

/// Client IP from proxy headers.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    // Try X-Forwarded-For first (may contain multiple IPs, take first)
    if let Some(xff) = headers.get("X-Forwarded-For") {
        if let Ok(xff_str) = xff.to_str() {
            return xff_str.split(',').next().map(|s| s.trim().to_string());
        }
    }
    // Try Cloudflare header
    if let Some(cf_ip) = headers.get("CF-Connecting-IP") {
        if let Ok(ip) = cf_ip.to_str() {
            return Some(ip.to_string());
        }
    }
    // Try X-Real-IP
    if let Some(real_ip) = headers.get("X-Real-IP") {
        if let Ok(ip) = real_ip.to_str() {
            return Some(ip.to_string());
        }
    }
    None
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
