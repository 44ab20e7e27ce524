//! Tenant and knowledge persistence
//!
//! The unique `(organization_id, thread_id, channel_id)` constraint is what
//! makes concurrent archival of the same thread safe: the insert is
//! `ON CONFLICT DO NOTHING` and the loser sees [`InsertOutcome::AlreadyExists`].

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use threadbase_shared::Plan;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ArchivalError, ArchivalResult};
use crate::job::Platform;
use crate::notify::UsageLevel;
use crate::platform::ThreadMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Integration {
    pub organization_id: Uuid,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationSummary {
    pub id: Uuid,
    pub name: String,
    pub plan: Plan,
    pub owner_email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnowledgeStatus {
    Active,
    Archived,
    Deleted,
}

impl KnowledgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeStatus::Active => "ACTIVE",
            KnowledgeStatus::Archived => "ARCHIVED",
            KnowledgeStatus::Deleted => "DELETED",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewKnowledgeItem {
    pub organization_id: Uuid,
    pub title: String,
    pub content: Vec<ThreadMessage>,
    pub summary: String,
    pub action_items: Vec<String>,
    pub embedding: Vec<f32>,
    pub source_type: Platform,
    pub channel_id: String,
    pub channel_name: String,
    pub thread_id: String,
    pub root_message_author: String,
    pub created_by_id: Uuid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeItem {
    pub id: Uuid,
    pub item: NewKnowledgeItem,
    pub status: KnowledgeStatus,
    pub view_count: i32,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created(Uuid),
    /// Another job archived the same thread first.
    AlreadyExists,
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn find_integration(
        &self,
        platform: Platform,
        team_id: &str,
    ) -> ArchivalResult<Option<Integration>>;

    /// User linked to this platform account within the organization.
    async fn find_linked_user(
        &self,
        organization_id: Uuid,
        platform: Platform,
        provider_user_id: &str,
    ) -> ArchivalResult<Option<Uuid>>;

    /// The organization owner, else its earliest member.
    async fn find_fallback_member(&self, organization_id: Uuid) -> ArchivalResult<Option<Uuid>>;

    async fn find_by_thread(
        &self,
        organization_id: Uuid,
        thread_id: &str,
        channel_id: &str,
    ) -> ArchivalResult<Option<Uuid>>;

    async fn insert_knowledge_item(&self, item: &NewKnowledgeItem) -> ArchivalResult<InsertOutcome>;

    async fn count_items_since(
        &self,
        organization_id: Uuid,
        since: OffsetDateTime,
    ) -> ArchivalResult<i64>;

    async fn organization(&self, organization_id: Uuid)
        -> ArchivalResult<Option<OrganizationSummary>>;

    async fn record_analytics_event(
        &self,
        organization_id: Uuid,
        user_id: Option<Uuid>,
        event: &str,
        properties: serde_json::Value,
    ) -> ArchivalResult<()>;

    /// Record that `level` was announced for the month starting at `month`.
    /// Returns `false` when it was already recorded, so each level goes out
    /// once per organization and month.
    async fn claim_usage_notice(
        &self,
        organization_id: Uuid,
        month: OffsetDateTime,
        level: UsageLevel,
    ) -> ArchivalResult<bool>;
}

/// pgvector text literal, e.g. `[0.1,0.2]`.
pub(crate) fn vector_literal(embedding: &[f32]) -> String {
    let parts: Vec<String> = embedding.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(","))
}

pub struct PgKnowledgeStore {
    pool: PgPool,
}

impl PgKnowledgeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KnowledgeStore for PgKnowledgeStore {
    async fn find_integration(
        &self,
        platform: Platform,
        team_id: &str,
    ) -> ArchivalResult<Option<Integration>> {
        let row: Option<(Uuid, String)> = sqlx::query_as(
            "SELECT organization_id, access_token FROM integrations WHERE provider = $1 AND external_team_id = $2",
        )
        .bind(platform.provider())
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(organization_id, access_token)| Integration {
            organization_id,
            access_token,
        }))
    }

    async fn find_linked_user(
        &self,
        organization_id: Uuid,
        platform: Platform,
        provider_user_id: &str,
    ) -> ArchivalResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM linked_accounts
            WHERE organization_id = $1 AND provider = $2 AND provider_user_id = $3
            "#,
        )
        .bind(organization_id)
        .bind(platform.provider())
        .bind(provider_user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn find_fallback_member(&self, organization_id: Uuid) -> ArchivalResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM users
            WHERE organization_id = $1
            ORDER BY (role = 'OWNER') DESC, created_at ASC
            LIMIT 1
            "#,
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn find_by_thread(
        &self,
        organization_id: Uuid,
        thread_id: &str,
        channel_id: &str,
    ) -> ArchivalResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM knowledge_items
            WHERE organization_id = $1 AND thread_id = $2 AND channel_id = $3
            "#,
        )
        .bind(organization_id)
        .bind(thread_id)
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn insert_knowledge_item(&self, item: &NewKnowledgeItem) -> ArchivalResult<InsertOutcome> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO knowledge_items (
                organization_id, title, content, summary, action_items, embedding,
                source_type, channel_id, channel_name, thread_id, root_message_author,
                created_by_id, status, view_count, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6::text::vector, $7, $8, $9, $10, $11, $12, 'ACTIVE', 0, NOW(), NOW())
            ON CONFLICT (organization_id, thread_id, channel_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(item.organization_id)
        .bind(&item.title)
        .bind(Json(&item.content))
        .bind(&item.summary)
        .bind(Json(&item.action_items))
        .bind(vector_literal(&item.embedding))
        .bind(item.source_type.as_str())
        .bind(&item.channel_id)
        .bind(&item.channel_name)
        .bind(&item.thread_id)
        .bind(&item.root_message_author)
        .bind(item.created_by_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((id,)) => InsertOutcome::Created(id),
            None => InsertOutcome::AlreadyExists,
        })
    }

    async fn count_items_since(
        &self,
        organization_id: Uuid,
        since: OffsetDateTime,
    ) -> ArchivalResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM knowledge_items
            WHERE organization_id = $1 AND created_at >= $2 AND status <> 'DELETED'
            "#,
        )
        .bind(organization_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn organization(
        &self,
        organization_id: Uuid,
    ) -> ArchivalResult<Option<OrganizationSummary>> {
        let row: Option<(Uuid, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT o.id, o.name, o.plan,
                   (SELECT u.email FROM users u
                    WHERE u.organization_id = o.id AND u.role = 'OWNER'
                    ORDER BY u.created_at ASC LIMIT 1)
            FROM organizations o
            WHERE o.id = $1
            "#,
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, name, plan, owner_email)) = row else {
            return Ok(None);
        };

        let plan = plan.parse().map_err(|e: threadbase_shared::UnknownPlan| {
            ArchivalError::Database(e.to_string())
        })?;

        Ok(Some(OrganizationSummary {
            id,
            name,
            plan,
            owner_email,
        }))
    }

    async fn record_analytics_event(
        &self,
        organization_id: Uuid,
        user_id: Option<Uuid>,
        event: &str,
        properties: serde_json::Value,
    ) -> ArchivalResult<()> {
        sqlx::query(
            r#"
            INSERT INTO analytics_events (organization_id, user_id, event, properties, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(organization_id)
        .bind(user_id)
        .bind(event)
        .bind(properties)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_usage_notice(
        &self,
        organization_id: Uuid,
        month: OffsetDateTime,
        level: UsageLevel,
    ) -> ArchivalResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO usage_notices (organization_id, month_start, level, sent_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (organization_id, month_start, level) DO NOTHING
            "#,
        )
        .bind(organization_id)
        .bind(month)
        .bind(level.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// Process-local store with the same uniqueness guarantee, for tests and
/// local development.
#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    organizations: HashMap<Uuid, OrganizationSummary>,
    /// (organization, user, is_owner), in join order.
    members: Vec<(Uuid, Uuid, bool)>,
    linked: HashMap<(Uuid, Platform, String), Uuid>,
    integrations: HashMap<(Platform, String), Integration>,
    items: Vec<KnowledgeItem>,
    events: Vec<AnalyticsEvent>,
    usage_notices: HashSet<(Uuid, OffsetDateTime, UsageLevel)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsEvent {
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub event: String,
    pub properties: serde_json::Value,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_organization(&self, name: &str, plan: Plan) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().await.organizations.insert(
            id,
            OrganizationSummary {
                id,
                name: name.to_string(),
                plan,
                owner_email: None,
            },
        );
        id
    }

    pub async fn add_member(&self, organization_id: Uuid, email: &str, owner: bool) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.inner.lock().await;
        state.members.push((organization_id, id, owner));
        if owner {
            if let Some(org) = state.organizations.get_mut(&organization_id) {
                org.owner_email.get_or_insert_with(|| email.to_string());
            }
        }
        id
    }

    pub async fn link_account(
        &self,
        organization_id: Uuid,
        platform: Platform,
        provider_user_id: &str,
        user_id: Uuid,
    ) {
        self.inner.lock().await.linked.insert(
            (organization_id, platform, provider_user_id.to_string()),
            user_id,
        );
    }

    pub async fn add_integration(
        &self,
        platform: Platform,
        team_id: &str,
        organization_id: Uuid,
        access_token: &str,
    ) {
        self.inner.lock().await.integrations.insert(
            (platform, team_id.to_string()),
            Integration {
                organization_id,
                access_token: access_token.to_string(),
            },
        );
    }

    pub async fn items(&self) -> Vec<KnowledgeItem> {
        self.inner.lock().await.items.clone()
    }

    pub async fn analytics_events(&self) -> Vec<AnalyticsEvent> {
        self.inner.lock().await.events.clone()
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn find_integration(
        &self,
        platform: Platform,
        team_id: &str,
    ) -> ArchivalResult<Option<Integration>> {
        Ok(self
            .inner
            .lock()
            .await
            .integrations
            .get(&(platform, team_id.to_string()))
            .cloned())
    }

    async fn find_linked_user(
        &self,
        organization_id: Uuid,
        platform: Platform,
        provider_user_id: &str,
    ) -> ArchivalResult<Option<Uuid>> {
        Ok(self
            .inner
            .lock()
            .await
            .linked
            .get(&(organization_id, platform, provider_user_id.to_string()))
            .copied())
    }

    async fn find_fallback_member(&self, organization_id: Uuid) -> ArchivalResult<Option<Uuid>> {
        let state = self.inner.lock().await;
        let mut members = state
            .members
            .iter()
            .filter(|(org, _, _)| *org == organization_id);
        let owner = members.clone().find(|(_, _, owner)| *owner);
        Ok(owner.or_else(|| members.next()).map(|(_, user, _)| *user))
    }

    async fn find_by_thread(
        &self,
        organization_id: Uuid,
        thread_id: &str,
        channel_id: &str,
    ) -> ArchivalResult<Option<Uuid>> {
        let state = self.inner.lock().await;
        Ok(state
            .items
            .iter()
            .find(|k| {
                k.item.organization_id == organization_id
                    && k.item.thread_id == thread_id
                    && k.item.channel_id == channel_id
            })
            .map(|k| k.id))
    }

    async fn insert_knowledge_item(&self, item: &NewKnowledgeItem) -> ArchivalResult<InsertOutcome> {
        let mut state = self.inner.lock().await;
        let exists = state.items.iter().any(|k| {
            k.item.organization_id == item.organization_id
                && k.item.thread_id == item.thread_id
                && k.item.channel_id == item.channel_id
        });
        if exists {
            return Ok(InsertOutcome::AlreadyExists);
        }

        let id = Uuid::new_v4();
        state.items.push(KnowledgeItem {
            id,
            item: item.clone(),
            status: KnowledgeStatus::Active,
            view_count: 0,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(InsertOutcome::Created(id))
    }

    async fn count_items_since(
        &self,
        organization_id: Uuid,
        since: OffsetDateTime,
    ) -> ArchivalResult<i64> {
        let state = self.inner.lock().await;
        let count = state
            .items
            .iter()
            .filter(|k| {
                k.item.organization_id == organization_id
                    && k.created_at >= since
                    && k.status != KnowledgeStatus::Deleted
            })
            .count();
        Ok(count as i64)
    }

    async fn organization(
        &self,
        organization_id: Uuid,
    ) -> ArchivalResult<Option<OrganizationSummary>> {
        Ok(self
            .inner
            .lock()
            .await
            .organizations
            .get(&organization_id)
            .cloned())
    }

    async fn record_analytics_event(
        &self,
        organization_id: Uuid,
        user_id: Option<Uuid>,
        event: &str,
        properties: serde_json::Value,
    ) -> ArchivalResult<()> {
        self.inner.lock().await.events.push(AnalyticsEvent {
            organization_id,
            user_id,
            event: event.to_string(),
            properties,
        });
        Ok(())
    }

    async fn claim_usage_notice(
        &self,
        organization_id: Uuid,
        month: OffsetDateTime,
        level: UsageLevel,
    ) -> ArchivalResult<bool> {
        Ok(self
            .inner
            .lock()
            .await
            .usage_notices
            .insert((organization_id, month, level)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(org: Uuid, user: Uuid) -> NewKnowledgeItem {
        NewKnowledgeItem {
            organization_id: org,
            title: "Deploy".into(),
            content: vec![],
            summary: "Summary unavailable.".into(),
            action_items: vec![],
            embedding: vec![0.5, -1.0],
            source_type: Platform::Slack,
            channel_id: "C1".into(),
            channel_name: "ops".into(),
            thread_id: "100.001".into(),
            root_message_author: "U1".into(),
            created_by_id: user,
        }
    }

    #[test]
    fn vector_literal_format() {
        assert_eq!(vector_literal(&[0.5, -1.0, 0.25]), "[0.5,-1,0.25]");
        assert_eq!(vector_literal(&[]), "[]");
    }

    #[tokio::test]
    async fn second_insert_of_same_thread_already_exists() {
        let store = InMemoryKnowledgeStore::new();
        let org = store.add_organization("Acme", Plan::Free).await;
        let user = store.add_member(org, "owner@acme.test", true).await;

        let first = store.insert_knowledge_item(&item(org, user)).await.unwrap();
        assert!(matches!(first, InsertOutcome::Created(_)));
        let second = store.insert_knowledge_item(&item(org, user)).await.unwrap();
        assert_eq!(second, InsertOutcome::AlreadyExists);
        assert_eq!(store.items().await.len(), 1);

        // Same thread in another organization is a different item
        let other = store.add_organization("Globex", Plan::Free).await;
        let third = store.insert_knowledge_item(&item(other, user)).await.unwrap();
        assert!(matches!(third, InsertOutcome::Created(_)));
    }

    #[tokio::test]
    async fn fallback_member_prefers_owner_then_earliest() {
        let store = InMemoryKnowledgeStore::new();
        let org = store.add_organization("Acme", Plan::Pro).await;
        assert_eq!(store.find_fallback_member(org).await.unwrap(), None);

        let first = store.add_member(org, "a@acme.test", false).await;
        let _second = store.add_member(org, "b@acme.test", false).await;
        assert_eq!(store.find_fallback_member(org).await.unwrap(), Some(first));

        let owner = store.add_member(org, "owner@acme.test", true).await;
        assert_eq!(store.find_fallback_member(org).await.unwrap(), Some(owner));
        assert_eq!(
            store.organization(org).await.unwrap().unwrap().owner_email.as_deref(),
            Some("owner@acme.test")
        );
    }
}
