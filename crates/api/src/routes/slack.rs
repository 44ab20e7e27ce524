//! Slack Events API ingress
//!
//! Handles the URL verification handshake and turns the archive reaction
//! into an archival job. Every request must carry a valid Slack signature.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use threadbase_archival::{ArchivalJob, SlackArchivalPayload};
use threadbase_shared::enqueue_job;

use crate::error::{ApiError, ApiResult};
use crate::routes::header_str;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SlackEnvelope {
    UrlVerification {
        challenge: String,
    },
    EventCallback {
        team_id: String,
        event_id: String,
        event: SlackEvent,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
struct SlackEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    reaction: Option<String>,
    #[serde(default)]
    item: Option<ReactionItem>,
}

#[derive(Debug, Deserialize)]
struct ReactionItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

/// POST /api/slack/events
pub async fn slack_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let Some(verifier) = state.slack_verifier.as_ref() else {
        return Err(ApiError::NotConfigured("Slack request verification"));
    };

    verifier
        .verify(
            header_str(&headers, verifier.timestamp_header()),
            header_str(&headers, verifier.signature_header()),
            &body,
        )
        .inspect_err(|reason| tracing::warn!(reason = %reason, "Rejected Slack request"))?;

    let envelope: SlackEnvelope = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid Slack event: {e}")))?;

    match envelope {
        SlackEnvelope::UrlVerification { challenge } => {
            Ok(Json(json!({ "challenge": challenge })).into_response())
        }
        SlackEnvelope::EventCallback {
            team_id,
            event_id,
            event,
        } => {
            let Some(job) = archival_job(&team_id, &event, &state.slack_archive_reaction) else {
                tracing::debug!(event_id = %event_id, event_type = %event.kind, "Ignoring Slack event");
                return Ok(StatusCode::OK.into_response());
            };

            // Slack redelivers unacknowledged events with the same event id
            let job_id = format!("slack-{event_id}");
            let outcome = enqueue_job(state.archival_queue.as_ref(), Some(&job_id), &job).await?;
            tracing::info!(
                event_id = %event_id,
                team_id = %team_id,
                channel_id = %job.channel_id(),
                thread_id = %job.thread_id(),
                outcome = ?outcome,
                "Slack archive reaction enqueued"
            );
            Ok(StatusCode::OK.into_response())
        }
        SlackEnvelope::Unsupported => Ok(StatusCode::OK.into_response()),
    }
}

/// An archival job for `reaction_added` with the archive reaction on a message.
fn archival_job(team_id: &str, event: &SlackEvent, reaction: &str) -> Option<ArchivalJob> {
    if event.kind != "reaction_added" || event.reaction.as_deref() != Some(reaction) {
        return None;
    }
    let item = event.item.as_ref().filter(|item| item.kind == "message")?;

    let job = ArchivalJob::Slack(SlackArchivalPayload {
        team_id: team_id.to_string(),
        channel_id: item.channel.clone()?,
        thread_ts: item.ts.clone()?,
        reacting_user_id: event.user.clone()?,
    });
    job.validate().ok().map(|_| job)
}
