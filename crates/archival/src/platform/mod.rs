//! Chat-platform adapters
//!
//! The archival worker talks to Slack and Discord only through
//! [`ThreadFetcher`] and [`ThreadReplier`], resolved per job from a
//! [`PlatformRegistry`].

mod discord;
mod slack;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::Platform;

pub use discord::{DiscordAdapter, DISCORD_API_BASE};
pub use slack::{SlackAdapter, SLACK_API_BASE};

/// Default timeout for chat-platform API calls.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One message of a captured conversation, in thread order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub author: String,
    pub text: String,
    pub timestamp: String,
}

/// Where a conversation lives on its platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadLocation {
    pub team_id: String,
    pub channel_id: String,
    pub thread_id: String,
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("rate limited by platform")]
    RateLimited,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("platform API error: {0}")]
    Api(String),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("no adapter registered for {0}")]
    Unsupported(Platform),
}

impl PlatformError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::Request(_) | PlatformError::RateLimited | PlatformError::Api(_)
        )
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        PlatformError::Request(e.to_string())
    }
}

#[async_trait]
pub trait ThreadFetcher: Send + Sync {
    /// All messages of the thread, root first. Empty when the thread is gone.
    async fn fetch_thread(
        &self,
        token: &str,
        location: &ThreadLocation,
    ) -> Result<Vec<ThreadMessage>, PlatformError>;

    async fn channel_name(
        &self,
        token: &str,
        location: &ThreadLocation,
    ) -> Result<String, PlatformError>;
}

#[async_trait]
pub trait ThreadReplier: Send + Sync {
    async fn post_reply(
        &self,
        token: &str,
        location: &ThreadLocation,
        text: &str,
    ) -> Result<(), PlatformError>;
}

/// A platform adapter that can both read and answer a thread.
pub trait ChatPlatform: ThreadFetcher + ThreadReplier {}

impl<T: ThreadFetcher + ThreadReplier> ChatPlatform for T {}

#[derive(Clone, Default)]
pub struct PlatformRegistry {
    adapters: HashMap<Platform, Arc<dyn ChatPlatform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, platform: Platform, adapter: Arc<dyn ChatPlatform>) -> Self {
        self.adapters.insert(platform, adapter);
        self
    }

    pub fn get(&self, platform: Platform) -> Result<Arc<dyn ChatPlatform>, PlatformError> {
        self.adapters
            .get(&platform)
            .cloned()
            .ok_or(PlatformError::Unsupported(platform))
    }
}

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_reports_missing_adapter() {
        let registry = PlatformRegistry::new()
            .register(Platform::Slack, Arc::new(SlackAdapter::new()));

        assert!(registry.get(Platform::Slack).is_ok());
        let err = registry.get(Platform::Discord).err().unwrap();
        assert!(matches!(err, PlatformError::Unsupported(Platform::Discord)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn transport_and_rate_limit_errors_are_retryable() {
        assert!(PlatformError::Request("connection reset".into()).is_retryable());
        assert!(PlatformError::RateLimited.is_retryable());
        assert!(!PlatformError::NotFound("channel_not_found".into()).is_retryable());
        assert!(!PlatformError::InvalidResponse("missing messages".into()).is_retryable());
    }
}
