//! Discord REST adapter
//!
//! A Discord "thread" is either a single message or a message with a thread
//! started from it. The job's thread id is the root message id.

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{http_client, PlatformError, ThreadFetcher, ThreadLocation, ThreadMessage, ThreadReplier};

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

pub struct DiscordAdapter {
    client: reqwest::Client,
    base_url: String,
    /// Used when the integration does not carry its own token.
    bot_token: Option<String>,
}

impl DiscordAdapter {
    pub fn new(bot_token: Option<String>) -> Self {
        Self::with_base_url(DISCORD_API_BASE, bot_token)
    }

    pub fn with_base_url(base_url: impl Into<String>, bot_token: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.filter(|t| !t.is_empty()),
        }
    }

    fn authorization(&self, token: &str) -> Result<String, PlatformError> {
        let token = if token.is_empty() {
            self.bot_token.as_deref().ok_or_else(|| {
                PlatformError::Unauthorized("no Discord bot token configured".to_string())
            })?
        } else {
            token
        };
        Ok(format!("Bot {token}"))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, PlatformError> {
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    PlatformError::Unauthorized(format!("HTTP {status}: {body}"))
                }
                StatusCode::NOT_FOUND => PlatformError::NotFound(what.to_string()),
                s if s.is_server_error() => PlatformError::Api(format!("HTTP {status}: {body}")),
                _ => PlatformError::InvalidResponse(format!("HTTP {status}: {body}")),
            });
        }

        response
            .json()
            .await
            .map_err(|e| PlatformError::InvalidResponse(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
    #[serde(default)]
    content: String,
    timestamp: String,
    author: DiscordUser,
    #[serde(default)]
    thread: Option<DiscordChannelRef>,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    username: String,
    #[serde(default)]
    global_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordChannelRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DiscordChannel {
    #[serde(default)]
    name: Option<String>,
}

impl From<DiscordMessage> for ThreadMessage {
    fn from(m: DiscordMessage) -> Self {
        ThreadMessage {
            author: m.author.global_name.unwrap_or(m.author.username),
            text: m.content,
            timestamp: m.timestamp,
        }
    }
}

#[async_trait]
impl ThreadFetcher for DiscordAdapter {
    async fn fetch_thread(
        &self,
        token: &str,
        location: &ThreadLocation,
    ) -> Result<Vec<ThreadMessage>, PlatformError> {
        let auth = self.authorization(token)?;
        let url = format!(
            "{}/channels/{}/messages/{}",
            self.base_url, location.channel_id, location.thread_id
        );

        let root: DiscordMessage = match self
            .send(self.client.get(url).header(AUTHORIZATION, &auth), "message")
            .await
        {
            Ok(root) => root,
            Err(PlatformError::NotFound(_)) => {
                tracing::info!(
                    channel_id = %location.channel_id,
                    message_id = %location.thread_id,
                    "Discord message no longer exists"
                );
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let thread_channel = root.thread.as_ref().map(|t| t.id.clone());
        let root_id = root.id.clone();
        let mut messages = vec![ThreadMessage::from(root)];

        if let Some(thread_id) = thread_channel {
            let url = format!("{}/channels/{thread_id}/messages", self.base_url);
            let mut replies: Vec<DiscordMessage> = self
                .send(
                    self.client
                        .get(url)
                        .header(AUTHORIZATION, &auth)
                        .query(&[("limit", "100")]),
                    "thread",
                )
                .await?;

            // Discord returns newest first
            replies.reverse();
            messages.extend(
                replies
                    .into_iter()
                    .filter(|m| m.id != root_id && !m.content.trim().is_empty())
                    .map(ThreadMessage::from),
            );
        }

        Ok(messages)
    }

    async fn channel_name(
        &self,
        token: &str,
        location: &ThreadLocation,
    ) -> Result<String, PlatformError> {
        let auth = self.authorization(token)?;
        let url = format!("{}/channels/{}", self.base_url, location.channel_id);
        let channel: DiscordChannel = self
            .send(self.client.get(url).header(AUTHORIZATION, auth), "channel")
            .await?;

        Ok(channel.name.unwrap_or_else(|| "direct-message".to_string()))
    }
}

#[async_trait]
impl ThreadReplier for DiscordAdapter {
    async fn post_reply(
        &self,
        token: &str,
        location: &ThreadLocation,
        text: &str,
    ) -> Result<(), PlatformError> {
        let auth = self.authorization(token)?;
        let url = format!("{}/channels/{}/messages", self.base_url, location.channel_id);
        let request = self
            .client
            .post(url)
            .header(AUTHORIZATION, auth)
            .json(&serde_json::json!({
                "content": text,
                "message_reference": { "message_id": location.thread_id },
                "allowed_mentions": { "parse": [] },
            }));

        let _: serde_json::Value = self.send(request, "channel").await?;
        Ok(())
    }
}
