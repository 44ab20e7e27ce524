//! Health check

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Map, Value};

use crate::state::AppState;

/// GET /health
///
/// Reports queue depths. Any unreachable queue makes the check fail.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let mut queues = Map::new();
    let mut healthy = true;

    for queue in [&state.archival_queue, &state.billing_queue] {
        match queue.counts().await {
            Ok(counts) => {
                queues.insert(queue.name().to_string(), json!(counts));
            }
            Err(e) => {
                tracing::error!(queue = %queue.name(), error = %e, "Queue health check failed");
                healthy = false;
                queues.insert(queue.name().to_string(), json!({ "error": e.to_string() }));
            }
        }
    }

    let (status, label) = if healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(json!({
            "status": label,
            "version": env!("CARGO_PKG_VERSION"),
            "queues": queues,
        })),
    )
}
