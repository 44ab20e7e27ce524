//! AI client for embeddings, summaries and action items
//!
//! Works with any OpenAI-compatible API. Calls are never retried here: a
//! failure surfaces as [`AiError`] and the queue's retry policy decides.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::platform::ThreadMessage;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_SUMMARY_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;

/// Upper bound on characters sent for embedding.
const MAX_EMBEDDING_INPUT_CHARS: usize = 24_000;
const MAX_ACTION_ITEMS: usize = 10;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("AI provider not configured")]
    NotConfigured,
    #[error("AI request timed out")]
    Timeout,
    #[error("AI provider unreachable: {0}")]
    Unreachable(String),
    #[error("AI request failed: HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("AI request failed: {0}")]
    RequestFailed(String),
    #[error("AI response parse error: {0}")]
    ParseError(String),
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl AiError {
    /// Timeouts, connection failures, throttling and provider outages.
    pub fn is_retryable(&self) -> bool {
        match self {
            AiError::Timeout | AiError::Unreachable(_) | AiError::RequestFailed(_) => true,
            AiError::Http { status, .. } => *status == 429 || *status >= 500,
            AiError::NotConfigured | AiError::ParseError(_) | AiError::DimensionMismatch { .. } => {
                false
            }
        }
    }
}

impl From<reqwest::Error> for AiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AiError::Timeout
        } else if e.is_connect() {
            AiError::Unreachable(e.to_string())
        } else {
            AiError::RequestFailed(e.to_string())
        }
    }
}

#[derive(Clone)]
pub struct AiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub embedding_model: String,
    pub summary_model: String,
    pub embedding_dimensions: usize,
    pub timeout: Duration,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            summary_model: DEFAULT_SUMMARY_MODEL.to_string(),
            embedding_dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            timeout: Duration::from_secs(30),
        }
    }
}

impl std::fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("embedding_model", &self.embedding_model)
            .field("summary_model", &self.summary_model)
            .field("embedding_dimensions", &self.embedding_dimensions)
            .finish()
    }
}

impl AiConfig {
    /// `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `EMBEDDING_MODEL`, `SUMMARY_MODEL`,
    /// `EMBEDDING_DIMENSIONS`. Unset or unparsable values keep the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        Self {
            base_url: var("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            api_key: var("OPENAI_API_KEY"),
            embedding_model: var("EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            summary_model: var("SUMMARY_MODEL").unwrap_or(defaults.summary_model),
            embedding_dimensions: var("EMBEDDING_DIMENSIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.embedding_dimensions),
            timeout: defaults.timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AiClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError>;

    async fn summarize(&self, messages: &[ThreadMessage]) -> Result<String, AiError>;

    async fn extract_action_items(&self, messages: &[ThreadMessage])
        -> Result<Vec<String>, AiError>;
}

/// `author: text` lines, one per message.
pub fn format_transcript(messages: &[ThreadMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.author, m.text))
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ---------------------------------------------------------------------------
// OpenAI-Compatible Client
// ---------------------------------------------------------------------------

pub struct OpenAiClient {
    client: reqwest::Client,
    config: AiConfig,
}

impl OpenAiClient {
    pub fn new(config: AiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            config: AiConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
        }
    }

    pub fn config(&self) -> &AiConfig {
        &self.config
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, AiError> {
        let api_key = self.config.api_key.as_deref().ok_or(AiError::NotConfigured)?;
        let url = format!("{}{path}", self.config.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::Http { status, body });
        }

        response
            .json()
            .await
            .map_err(|e| AiError::ParseError(e.to_string()))
    }

    async fn complete(&self, system: &str, user: String, max_tokens: u32) -> Result<String, AiError> {
        let request = ChatCompletionRequest {
            model: &self.config.summary_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens,
            temperature: 0.2,
        };

        let response: ChatCompletionResponse = self.post("/chat/completions", &request).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AiError::ParseError("no content in response".to_string()))
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

const SUMMARY_PROMPT: &str = "You summarize team chat conversations for a knowledge base. \
Write two to four sentences covering the problem discussed, the decision or answer reached, \
and any open questions. Do not invent details.";

const ACTION_ITEMS_PROMPT: &str = "Extract concrete action items from this team chat \
conversation. Respond with a JSON array of strings, one short imperative sentence per item. \
Respond with [] when there are none.";

#[async_trait]
impl AiClient for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError> {
        let request = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: truncate_chars(text, MAX_EMBEDDING_INPUT_CHARS),
        };
        let response: EmbeddingResponse = self.post("/embeddings", &request).await?;

        let embedding = response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AiError::ParseError("no embedding in response".to_string()))?;

        if embedding.len() != self.config.embedding_dimensions {
            return Err(AiError::DimensionMismatch {
                expected: self.config.embedding_dimensions,
                actual: embedding.len(),
            });
        }
        Ok(embedding)
    }

    async fn summarize(&self, messages: &[ThreadMessage]) -> Result<String, AiError> {
        self.complete(SUMMARY_PROMPT, format_transcript(messages), 300)
            .await
    }

    async fn extract_action_items(
        &self,
        messages: &[ThreadMessage],
    ) -> Result<Vec<String>, AiError> {
        let raw = self
            .complete(ACTION_ITEMS_PROMPT, format_transcript(messages), 400)
            .await?;
        Ok(parse_action_items(&raw))
    }
}

/// Accepts a JSON array of strings (optionally fenced), else a bulleted or
/// numbered list.
pub fn parse_action_items(raw: &str) -> Vec<String> {
    let trimmed = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(items) = serde_json::from_str::<Vec<String>>(trimmed) {
        return items
            .into_iter()
            .map(|i| i.trim().to_string())
            .filter(|i| !i.is_empty())
            .take(MAX_ACTION_ITEMS)
            .collect();
    }

    trimmed
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c == '-' || c == '*' || c == '•')
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start_matches(['.', ')'])
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty() && !line.eq_ignore_ascii_case("none"))
        .take(MAX_ACTION_ITEMS)
        .collect()
}
