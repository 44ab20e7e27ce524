//! Discord interactions endpoint
//!
//! Answers Discord's PING and turns the "Archive conversation" message
//! command into an archival job.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use threadbase_archival::{ArchivalJob, DiscordArchivalPayload};
use threadbase_shared::enqueue_job;

use crate::error::{ApiError, ApiResult};
use crate::routes::header_str;
use crate::state::AppState;

const PING: u8 = 1;
const APPLICATION_COMMAND: u8 = 2;
/// Command invoked from a message's context menu.
const MESSAGE_COMMAND: u8 = 3;

const PONG: u8 = 1;
const CHANNEL_MESSAGE_WITH_SOURCE: u8 = 4;
const EPHEMERAL: u32 = 1 << 6;

#[derive(Debug, Deserialize)]
struct Interaction {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    member: Option<Member>,
    #[serde(default)]
    user: Option<User>,
    #[serde(default)]
    data: Option<CommandData>,
}

#[derive(Debug, Deserialize)]
struct Member {
    user: User,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CommandData {
    #[serde(rename = "type", default)]
    kind: Option<u8>,
    #[serde(default)]
    target_id: Option<String>,
}

impl Interaction {
    /// Guild interactions carry `member.user`, DMs carry `user`.
    fn user_id(&self) -> Option<&str> {
        self.member
            .as_ref()
            .map(|m| m.user.id.as_str())
            .or_else(|| self.user.as_ref().map(|u| u.id.as_str()))
    }
}

fn ephemeral(content: &str) -> Json<Value> {
    Json(json!({
        "type": CHANNEL_MESSAGE_WITH_SOURCE,
        "data": {"content": content, "flags": EPHEMERAL}
    }))
}

/// POST /api/discord/interactions
pub async fn discord_interactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let Some(verifier) = state.discord_verifier.as_ref() else {
        return Err(ApiError::NotConfigured("Discord request verification"));
    };

    verifier
        .verify(
            header_str(&headers, verifier.timestamp_header()),
            header_str(&headers, verifier.signature_header()),
            &body,
        )
        .inspect_err(|reason| tracing::warn!(reason = %reason, "Rejected Discord interaction"))?;

    let interaction: Interaction = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid interaction: {e}")))?;

    match interaction.kind {
        PING => Ok(Json(json!({ "type": PONG }))),
        APPLICATION_COMMAND => {
            let Some(job) = archival_job(&interaction) else {
                tracing::debug!(interaction_id = %interaction.id, "Unsupported Discord command");
                return Ok(ephemeral(
                    "Use this command on a message in a server channel.",
                ));
            };

            let job_id = format!("discord-{}", interaction.id);
            let outcome = enqueue_job(state.archival_queue.as_ref(), Some(&job_id), &job).await?;
            tracing::info!(
                interaction_id = %interaction.id,
                guild_id = %job.team_id(),
                channel_id = %job.channel_id(),
                message_id = %job.thread_id(),
                outcome = ?outcome,
                "Discord archive command enqueued"
            );
            Ok(ephemeral("Archiving this conversation. I'll reply here when it's saved."))
        }
        other => {
            tracing::debug!(interaction_type = other, "Ignoring Discord interaction");
            Ok(ephemeral("This interaction is not supported."))
        }
    }
}

fn archival_job(interaction: &Interaction) -> Option<ArchivalJob> {
    let data = interaction.data.as_ref()?;
    if data.kind != Some(MESSAGE_COMMAND) {
        return None;
    }

    let job = ArchivalJob::Discord(DiscordArchivalPayload {
        guild_id: interaction.guild_id.clone()?,
        channel_id: interaction.channel_id.clone()?,
        thread_ts: data.target_id.clone()?,
        reacting_user_id: interaction.user_id()?.to_string(),
    });
    job.validate().ok().map(|_| job)
}
