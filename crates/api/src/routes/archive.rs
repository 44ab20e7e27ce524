//! Archive trigger ingress
//!
//! Internal producers (the chat bots, scripted backfills) post archival jobs
//! here with a shared bearer secret.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::Json;
use serde::Serialize;
use subtle::ConstantTimeEq;
use threadbase_archival::ArchivalJob;
use threadbase_shared::{enqueue_job, EnqueueOutcome};

use crate::error::{ApiError, ApiResult};
use crate::routes::header_str;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ArchiveResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ArchiveResponse {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// POST /api/archive
///
/// Bad payloads answer 200 with `success: false` so the caller does not
/// redeliver them. Only queue failures are a 500.
pub async fn archive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ArchiveResponse>> {
    if !bearer_matches(&headers, &state.archive_secret) {
        tracing::warn!("Archive request with missing or invalid secret");
        return Err(ApiError::Unauthorized);
    }

    let job: ArchivalJob = match serde_json::from_slice(&body) {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!(error = %e, "Invalid archive payload");
            return Ok(Json(ArchiveResponse::rejected(format!(
                "invalid payload: {e}"
            ))));
        }
    };
    if let Err(e) = job.validate() {
        tracing::warn!(error = %e, "Invalid archive payload");
        return Ok(Json(ArchiveResponse::rejected(e)));
    }

    let outcome = enqueue_job(state.archival_queue.as_ref(), None, &job).await?;
    tracing::info!(
        source = %job.platform(),
        team_id = %job.team_id(),
        channel_id = %job.channel_id(),
        thread_id = %job.thread_id(),
        duplicate = outcome == EnqueueOutcome::Duplicate,
        "Archival job enqueued"
    );

    Ok(Json(ArchiveResponse::ok()))
}

fn bearer_matches(headers: &HeaderMap, secret: &str) -> bool {
    let Some(token) = header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|value| value.strip_prefix("Bearer "))
    else {
        return false;
    };
    // Constant-time comparison
    bool::from(token.trim().as_bytes().ct_eq(secret.as_bytes()))
}
