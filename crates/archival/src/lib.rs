// Archival crate clippy configuration
#![allow(clippy::too_many_arguments)] // Post-archive side effects take the whole job context
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Threadbase Archival Module
//!
//! Conversation-to-knowledge pipeline: verify chat events, queue archival
//! jobs, and turn threads into searchable knowledge items.
//!
//! ## Features
//!
//! - **Verification**: Slack HMAC and Discord Ed25519 request signatures with a replay window
//! - **Platforms**: Slack and Discord adapters behind fetch/reply traits
//! - **AI**: Embeddings, summaries and action items from an OpenAI-compatible API
//! - **Idempotency**: One knowledge item per organization, thread and channel
//! - **Usage**: Plan limit warnings to the organization owner

pub mod ai;
pub mod error;
pub mod job;
pub mod notify;
pub mod platform;
pub mod store;
pub mod usage;
pub mod verify;
pub mod worker;


// AI
pub use ai::{AiClient, AiConfig, AiError, OpenAiClient};

// Error
pub use error::{ArchivalError, ArchivalResult};

// Jobs
pub use job::{
    ArchivalJob, DiscordArchivalPayload, Platform, SlackArchivalPayload, ARCHIVAL_QUEUE,
};

// Notifications
pub use notify::{
    ErrorReport, ErrorReporter, LogErrorReporter, LogNotifier, ResendNotifier, UsageLevel,
    UsageNotice, UsageNotifier, WebhookErrorReporter,
};

// Platforms
pub use platform::{
    ChatPlatform, DiscordAdapter, PlatformError, PlatformRegistry, SlackAdapter, ThreadFetcher,
    ThreadLocation, ThreadMessage, ThreadReplier,
};

// Store
pub use store::{
    InMemoryKnowledgeStore, InsertOutcome, Integration, KnowledgeItem, KnowledgeStatus,
    KnowledgeStore, NewKnowledgeItem, PgKnowledgeStore,
};

// Verification
pub use verify::{
    DiscordSignatureVerifier, InvalidPublicKey, SignatureRejection, SignatureVerifier,
    SlackSignatureVerifier, REPLAY_WINDOW_SECS,
};

// Worker
pub use worker::{ArchivalOptions, ArchivalWorker, ArchiveOutcome, SUMMARY_FALLBACK};
