//! Slack Web API adapter

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{http_client, PlatformError, ThreadFetcher, ThreadLocation, ThreadMessage, ThreadReplier};

pub const SLACK_API_BASE: &str = "https://slack.com/api";

/// Upper bound on `conversations.replies` pages per thread.
const MAX_PAGES: usize = 10;

pub struct SlackAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl Default for SlackAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SlackAdapter {
    pub fn new() -> Self {
        Self::with_base_url(SLACK_API_BASE)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, PlatformError> {
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PlatformError::RateLimited);
        }
        if status.is_server_error() {
            return Err(PlatformError::Api(format!("HTTP {status}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PlatformError::InvalidResponse(e.to_string()))?;

        if body.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let code = body
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown_error");
            return Err(classify_error(code));
        }

        serde_json::from_value(body).map_err(|e| PlatformError::InvalidResponse(e.to_string()))
    }
}

fn classify_error(code: &str) -> PlatformError {
    match code {
        "ratelimited" => PlatformError::RateLimited,
        "invalid_auth" | "not_authed" | "token_revoked" | "account_inactive"
        | "missing_scope" => PlatformError::Unauthorized(code.to_string()),
        "thread_not_found" | "channel_not_found" | "message_not_found" | "not_in_channel" => {
            PlatformError::NotFound(code.to_string())
        }
        "internal_error" | "fatal_error" | "service_unavailable" | "request_timeout" => {
            PlatformError::Api(code.to_string())
        }
        other => PlatformError::InvalidResponse(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct RepliesResponse {
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: String,
    ts: String,
}

impl From<SlackMessage> for ThreadMessage {
    fn from(m: SlackMessage) -> Self {
        ThreadMessage {
            author: m
                .user
                .or(m.username)
                .or(m.bot_id)
                .unwrap_or_else(|| "unknown".to_string()),
            text: m.text,
            timestamp: m.ts,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    channel: ChannelInfo,
}

#[derive(Debug, Deserialize)]
struct ChannelInfo {
    #[serde(default)]
    name: Option<String>,
}

#[async_trait]
impl ThreadFetcher for SlackAdapter {
    async fn fetch_thread(
        &self,
        token: &str,
        location: &ThreadLocation,
    ) -> Result<Vec<ThreadMessage>, PlatformError> {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut query = vec![
                ("channel", location.channel_id.clone()),
                ("ts", location.thread_id.clone()),
                ("limit", "200".to_string()),
            ];
            if let Some(c) = cursor.take() {
                query.push(("cursor", c));
            }

            let request = self
                .client
                .get(self.url("conversations.replies"))
                .bearer_auth(token)
                .query(&query);

            let page: RepliesResponse = match self.call(request).await {
                Ok(page) => page,
                Err(PlatformError::NotFound(code)) if code == "thread_not_found" => {
                    tracing::info!(
                        channel_id = %location.channel_id,
                        thread_ts = %location.thread_id,
                        "Slack thread no longer exists"
                    );
                    return Ok(Vec::new());
                }
                Err(e) => return Err(e),
            };

            messages.extend(page.messages.into_iter().map(ThreadMessage::from));

            match page.response_metadata.map(|m| m.next_cursor) {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        if cursor.is_some() {
            tracing::warn!(
                channel_id = %location.channel_id,
                thread_ts = %location.thread_id,
                pages = MAX_PAGES,
                fetched = messages.len(),
                "Slack thread exceeds page cap, archiving the first messages only"
            );
        }

        Ok(messages)
    }

    async fn channel_name(
        &self,
        token: &str,
        location: &ThreadLocation,
    ) -> Result<String, PlatformError> {
        let request = self
            .client
            .get(self.url("conversations.info"))
            .bearer_auth(token)
            .query(&[("channel", location.channel_id.as_str())]);

        let info: InfoResponse = self.call(request).await?;
        Ok(info
            .channel
            .name
            .unwrap_or_else(|| location.channel_id.clone()))
    }
}

#[async_trait]
impl ThreadReplier for SlackAdapter {
    async fn post_reply(
        &self,
        token: &str,
        location: &ThreadLocation,
        text: &str,
    ) -> Result<(), PlatformError> {
        let request = self
            .client
            .post(self.url("chat.postMessage"))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "channel": location.channel_id,
                "thread_ts": location.thread_id,
                "text": text,
            }));

        let _: serde_json::Value = self.call(request).await?;
        Ok(())
    }
}
