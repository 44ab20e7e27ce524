//! Archival job model
//!
//! Jobs are serialized adjacently tagged, `{"source": "SLACK", "payload": {...}}`,
//! so producers in other services can build them without this crate.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const ARCHIVAL_QUEUE: &str = "knowledge-archival";

/// Chat platform a conversation was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Slack,
    Discord,
}

impl Platform {
    /// Value stored in `knowledge_items.source_type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Slack => "SLACK",
            Platform::Discord => "DISCORD",
        }
    }

    /// Value stored in `integrations.provider` and `linked_accounts.provider`.
    pub fn provider(&self) -> &'static str {
        match self {
            Platform::Slack => "slack",
            Platform::Discord => "discord",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackArchivalPayload {
    pub team_id: String,
    pub channel_id: String,
    pub thread_ts: String,
    pub reacting_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordArchivalPayload {
    pub guild_id: String,
    pub channel_id: String,
    /// Id of the message the conversation hangs off.
    pub thread_ts: String,
    pub reacting_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "payload")]
pub enum ArchivalJob {
    #[serde(rename = "SLACK")]
    Slack(SlackArchivalPayload),
    #[serde(rename = "DISCORD")]
    Discord(DiscordArchivalPayload),
}

impl ArchivalJob {
    pub fn platform(&self) -> Platform {
        match self {
            ArchivalJob::Slack(_) => Platform::Slack,
            ArchivalJob::Discord(_) => Platform::Discord,
        }
    }

    /// Slack team id or Discord guild id.
    pub fn team_id(&self) -> &str {
        match self {
            ArchivalJob::Slack(p) => &p.team_id,
            ArchivalJob::Discord(p) => &p.guild_id,
        }
    }

    pub fn channel_id(&self) -> &str {
        match self {
            ArchivalJob::Slack(p) => &p.channel_id,
            ArchivalJob::Discord(p) => &p.channel_id,
        }
    }

    pub fn thread_id(&self) -> &str {
        match self {
            ArchivalJob::Slack(p) => &p.thread_ts,
            ArchivalJob::Discord(p) => &p.thread_ts,
        }
    }

    pub fn reacting_user_id(&self) -> &str {
        match self {
            ArchivalJob::Slack(p) => &p.reacting_user_id,
            ArchivalJob::Discord(p) => &p.reacting_user_id,
        }
    }

    /// Reject payloads with blank identifiers before they reach the queue.
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("team", self.team_id()),
            ("channelId", self.channel_id()),
            ("threadTs", self.thread_id()),
            ("reactingUserId", self.reacting_user_id()),
        ];
        match fields.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((name, _)) => Err(format!("{name} must not be empty")),
            None => Ok(()),
        }
    }
}
