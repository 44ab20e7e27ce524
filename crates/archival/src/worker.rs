//! Knowledge archival worker
//!
//! Turns a captured conversation into a knowledge item:
//!
//! 1. resolve the tenant from the platform integration
//! 2. attribute the archive to the reacting user or a fallback member
//! 3. fetch the thread (empty thread is a no-op)
//! 4. skip threads that are already archived
//! 5. embed the transcript (failure fails the job)
//! 6. summarize and extract action items (failures degrade to fallbacks)
//! 7. insert, relying on the unique thread constraint for concurrent jobs
//! 8. reply in the thread, record analytics, check plan usage
//! 9. on any failure, tell the user in the thread

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use threadbase_shared::{JobAttempt, JobEnvelope, JobError, JobHandler};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::ai::{format_transcript, AiClient, AiError};
use crate::error::{ArchivalError, ArchivalResult};
use crate::job::{ArchivalJob, Platform};
use crate::notify::{ErrorReport, ErrorReporter, UsageNotifier};
use crate::platform::{ChatPlatform, PlatformRegistry, ThreadLocation, ThreadMessage};
use crate::store::{InsertOutcome, Integration, KnowledgeStore, NewKnowledgeItem};
use crate::usage::check_usage;

pub const ARCHIVED_EVENT: &str = "knowledge_item.archived";
pub const SUMMARY_FALLBACK: &str = "Summary unavailable.";
pub const FAILURE_REPLY: &str =
    "Sorry, I couldn't save this conversation to your knowledge base. Please try again in a few minutes.";
pub const RETRY_REPLY: &str =
    "Sorry, I couldn't save this conversation to your knowledge base yet. I'll try again automatically.";

const TITLE_MAX_CHARS: usize = 80;

#[derive(Debug, Clone)]
pub struct ArchivalOptions {
    /// Base URL for links to saved items in confirmation replies.
    pub app_url: Option<String>,
    /// Extra attempts for the confirmation reply.
    pub reply_retries: usize,
    pub reply_backoff: Duration,
}

impl Default for ArchivalOptions {
    fn default() -> Self {
        Self {
            app_url: None,
            reply_retries: 2,
            reply_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived { item_id: Uuid },
    AlreadyArchived,
    EmptyThread,
}

pub struct ArchivalWorker {
    store: Arc<dyn KnowledgeStore>,
    platforms: PlatformRegistry,
    ai: Arc<dyn AiClient>,
    errors: Arc<dyn ErrorReporter>,
    notifier: Arc<dyn UsageNotifier>,
    options: ArchivalOptions,
}

impl ArchivalWorker {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        platforms: PlatformRegistry,
        ai: Arc<dyn AiClient>,
        errors: Arc<dyn ErrorReporter>,
        notifier: Arc<dyn UsageNotifier>,
    ) -> Self {
        Self {
            store,
            platforms,
            ai,
            errors,
            notifier,
            options: ArchivalOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ArchivalOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn process(
        &self,
        job: &ArchivalJob,
        attempt: JobAttempt,
    ) -> ArchivalResult<ArchiveOutcome> {
        job.validate().map_err(ArchivalError::InvalidJob)?;

        let platform = job.platform();
        let adapter = self.platforms.get(platform)?;

        let integration = self
            .store
            .find_integration(platform, job.team_id())
            .await?
            .ok_or_else(|| ArchivalError::TenantNotFound {
                provider: platform.provider().to_string(),
                team_id: job.team_id().to_string(),
            })?;

        let location = ThreadLocation {
            team_id: job.team_id().to_string(),
            channel_id: job.channel_id().to_string(),
            thread_id: job.thread_id().to_string(),
        };

        tracing::info!(
            org_id = %integration.organization_id,
            source = %platform,
            channel_id = %location.channel_id,
            thread_id = %location.thread_id,
            attempt = attempt.number,
            "Archiving conversation"
        );

        match self
            .archive(job, &integration, adapter.as_ref(), &location)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let final_attempt = !e.is_retryable() || attempt.is_last();
                let reply = if final_attempt { FAILURE_REPLY } else { RETRY_REPLY };
                self.post_reply(adapter.as_ref(), &integration.access_token, &location, reply)
                    .await;

                if final_attempt {
                    self.errors
                        .report(ErrorReport {
                            component: "archival",
                            message: format!("Archival failed permanently: {e}"),
                            context: json!({
                                "organization_id": integration.organization_id,
                                "source": platform.as_str(),
                                "channel_id": location.channel_id,
                                "thread_id": location.thread_id,
                                "attempt": attempt.number,
                            }),
                        })
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn archive(
        &self,
        job: &ArchivalJob,
        integration: &Integration,
        adapter: &dyn ChatPlatform,
        location: &ThreadLocation,
    ) -> ArchivalResult<ArchiveOutcome> {
        let org_id = integration.organization_id;
        let token = integration.access_token.as_str();
        let platform = job.platform();

        let actor = self
            .resolve_actor(org_id, platform, job.reacting_user_id())
            .await?;

        let messages = adapter.fetch_thread(token, location).await?;
        if messages.is_empty() {
            tracing::info!(
                org_id = %org_id,
                thread_id = %location.thread_id,
                "Thread has no messages, nothing to archive"
            );
            return Ok(ArchiveOutcome::EmptyThread);
        }

        if let Some(existing) = self
            .store
            .find_by_thread(org_id, &location.thread_id, &location.channel_id)
            .await?
        {
            tracing::info!(
                org_id = %org_id,
                item_id = %existing,
                thread_id = %location.thread_id,
                "Thread already archived"
            );
            return Ok(ArchiveOutcome::AlreadyArchived);
        }

        let embedding = self.ai.embed(&format_transcript(&messages)).await?;

        let (summary, action_items) = tokio::join!(
            self.ai.summarize(&messages),
            self.ai.extract_action_items(&messages)
        );
        let summary = match summary {
            Ok(summary) => summary,
            Err(e) => {
                self.report_degraded("summary", &e, org_id, location).await;
                SUMMARY_FALLBACK.to_string()
            }
        };
        let action_items = match action_items {
            Ok(items) => items,
            Err(e) => {
                self.report_degraded("action_items", &e, org_id, location).await;
                Vec::new()
            }
        };

        let channel_name = match adapter.channel_name(token, location).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(
                    channel_id = %location.channel_id,
                    error = %e,
                    "Failed to resolve channel name, using channel id"
                );
                location.channel_id.clone()
            }
        };

        let item = NewKnowledgeItem {
            organization_id: org_id,
            title: derive_title(&messages, &channel_name),
            root_message_author: messages
                .first()
                .map(|m| m.author.clone())
                .unwrap_or_default(),
            content: messages,
            summary,
            action_items,
            embedding,
            source_type: platform,
            channel_id: location.channel_id.clone(),
            channel_name,
            thread_id: location.thread_id.clone(),
            created_by_id: actor,
        };

        let item_id = match self.store.insert_knowledge_item(&item).await? {
            InsertOutcome::Created(id) => id,
            InsertOutcome::AlreadyExists => {
                tracing::info!(
                    org_id = %org_id,
                    thread_id = %location.thread_id,
                    "Thread was archived concurrently by another job"
                );
                return Ok(ArchiveOutcome::AlreadyArchived);
            }
        };

        tracing::info!(
            org_id = %org_id,
            item_id = %item_id,
            title = %item.title,
            messages = item.content.len(),
            "Knowledge item created"
        );

        self.after_archive(&item, item_id, actor, adapter, token, location)
            .await;

        Ok(ArchiveOutcome::Archived { item_id })
    }

    /// Linked user for the reacting account, else the organization owner or
    /// earliest member.
    async fn resolve_actor(
        &self,
        org_id: Uuid,
        platform: Platform,
        reacting_user_id: &str,
    ) -> ArchivalResult<Uuid> {
        if let Some(user_id) = self
            .store
            .find_linked_user(org_id, platform, reacting_user_id)
            .await?
        {
            return Ok(user_id);
        }

        let fallback = self.store.find_fallback_member(org_id).await?;
        match fallback {
            Some(user_id) => {
                tracing::debug!(
                    org_id = %org_id,
                    reacting_user_id = %reacting_user_id,
                    "Reacting user is not linked, attributing to fallback member"
                );
                Ok(user_id)
            }
            None => Err(ArchivalError::NoMembers(org_id)),
        }
    }

    /// Side effects of a successful archive. None of them fail the job.
    async fn after_archive(
        &self,
        item: &NewKnowledgeItem,
        item_id: Uuid,
        actor: Uuid,
        adapter: &dyn ChatPlatform,
        token: &str,
        location: &ThreadLocation,
    ) {
        let reply = self.success_reply(&item.title, item_id);
        self.post_reply(adapter, token, location, &reply).await;

        if let Err(e) = self
            .store
            .record_analytics_event(
                item.organization_id,
                Some(actor),
                ARCHIVED_EVENT,
                json!({
                    "knowledge_item_id": item_id,
                    "source": item.source_type.as_str(),
                    "channel_id": item.channel_id,
                    "message_count": item.content.len(),
                    "action_item_count": item.action_items.len(),
                }),
            )
            .await
        {
            tracing::warn!(
                org_id = %item.organization_id,
                error = %e,
                "Failed to record analytics event"
            );
        }

        if let Err(e) = check_usage(
            self.store.as_ref(),
            self.notifier.as_ref(),
            item.organization_id,
            OffsetDateTime::now_utc(),
        )
        .await
        {
            tracing::warn!(
                org_id = %item.organization_id,
                error = %e,
                "Failed to check plan usage"
            );
        }
    }

    fn success_reply(&self, title: &str, item_id: Uuid) -> String {
        match &self.options.app_url {
            Some(base) => format!(
                "Saved to your knowledge base: *{title}*\n{}/knowledge/{item_id}",
                base.trim_end_matches('/')
            ),
            None => format!("Saved to your knowledge base: *{title}*"),
        }
    }

    /// Post into the thread with a short retry; failures are logged only.
    async fn post_reply(
        &self,
        adapter: &dyn ChatPlatform,
        token: &str,
        location: &ThreadLocation,
        text: &str,
    ) {
        let base_ms = u64::try_from(self.options.reply_backoff.as_millis()).unwrap_or(u64::MAX);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(base_ms.max(1))
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.options.reply_retries);

        if let Err(e) = Retry::spawn(strategy, || adapter.post_reply(token, location, text)).await {
            tracing::warn!(
                channel_id = %location.channel_id,
                thread_id = %location.thread_id,
                error = %e,
                "Failed to post reply in thread"
            );
        }
    }

    async fn report_degraded(
        &self,
        step: &'static str,
        error: &AiError,
        org_id: Uuid,
        location: &ThreadLocation,
    ) {
        tracing::warn!(
            org_id = %org_id,
            thread_id = %location.thread_id,
            step,
            error = %error,
            "AI step failed, using fallback"
        );
        self.errors
            .report(ErrorReport {
                component: "archival",
                message: format!("AI {step} failed: {error}"),
                context: json!({
                    "organization_id": org_id,
                    "channel_id": location.channel_id,
                    "thread_id": location.thread_id,
                }),
            })
            .await;
    }
}

/// First line of the root message, at most 80 characters.
pub fn derive_title(messages: &[ThreadMessage], channel_name: &str) -> String {
    let first_line = messages
        .first()
        .and_then(|m| m.text.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or_default();

    if first_line.is_empty() {
        return format!("Conversation in #{channel_name}");
    }
    if first_line.chars().count() <= TITLE_MAX_CHARS {
        return first_line.to_string();
    }
    let truncated: String = first_line.chars().take(TITLE_MAX_CHARS - 3).collect();
    format!("{}...", truncated.trim_end())
}

#[async_trait]
impl JobHandler for ArchivalWorker {
    fn name(&self) -> &'static str {
        "knowledge-archival"
    }

    async fn handle(&self, job: &JobEnvelope, attempt: JobAttempt) -> Result<(), JobError> {
        let archival: ArchivalJob = job
            .decode()
            .map_err(|e| JobError::Permanent(format!("malformed archival job: {e}")))?;

        match self.process(&archival, attempt).await {
            Ok(outcome) => {
                tracing::debug!(job_id = %job.id, outcome = ?outcome, "Archival job done");
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job.id,
                    source = %archival.platform(),
                    attempt = attempt.number,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Archival job failed"
                );
                if e.is_retryable() {
                    Err(JobError::Retryable(e.to_string()))
                } else {
                    Err(JobError::Permanent(e.to_string()))
                }
            }
        }
    }
}
