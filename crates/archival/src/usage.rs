//! Monthly archive usage checks

use threadbase_shared::Plan;
use time::{Duration, OffsetDateTime, UtcOffset};
use uuid::Uuid;

use crate::error::ArchivalResult;
use crate::notify::{UsageLevel, UsageNotice, UsageNotifier};
use crate::store::KnowledgeStore;

/// Midnight UTC on the first day of `now`'s month.
pub fn month_start(now: OffsetDateTime) -> OffsetDateTime {
    let now = now.to_offset(UtcOffset::UTC);
    let first = now.date() - Duration::days(i64::from(now.day()) - 1);
    first.midnight().assume_utc()
}

/// Highest level at or below this month's `count`.
pub fn usage_level(plan: Plan, count: i64) -> Option<UsageLevel> {
    let limit = plan.monthly_archive_limit()?;
    if count >= limit {
        Some(UsageLevel::Reached)
    } else if plan
        .usage_warning_threshold()
        .is_some_and(|threshold| count >= threshold)
    {
        Some(UsageLevel::Approaching)
    } else {
        None
    }
}

/// Count this month's archives and notify the owner the first time each
/// level is crossed in the month.
pub async fn check_usage(
    store: &dyn KnowledgeStore,
    notifier: &dyn UsageNotifier,
    organization_id: Uuid,
    now: OffsetDateTime,
) -> ArchivalResult<Option<UsageNotice>> {
    let Some(org) = store.organization(organization_id).await? else {
        return Ok(None);
    };

    let month = month_start(now);
    let used = store.count_items_since(organization_id, month).await?;
    let (Some(level), Some(limit)) = (usage_level(org.plan, used), org.plan.monthly_archive_limit())
    else {
        return Ok(None);
    };

    let Some(owner_email) = org.owner_email else {
        tracing::warn!(
            org_id = %organization_id,
            used,
            limit,
            "Usage threshold crossed but organization has no owner email"
        );
        return Ok(None);
    };

    if !store.claim_usage_notice(organization_id, month, level).await? {
        return Ok(None);
    }

    let notice = UsageNotice {
        organization_id,
        organization_name: org.name,
        owner_email,
        plan: org.plan,
        used,
        limit,
        level,
    };

    if let Err(e) = notifier.notify(&notice).await {
        tracing::warn!(
            org_id = %organization_id,
            error = %e,
            "Failed to send usage notification"
        );
    }
    Ok(Some(notice))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::job::Platform;
    use crate::notify::NotifyError;
    use crate::store::{InMemoryKnowledgeStore, NewKnowledgeItem};
    use time::macros::datetime;

    #[derive(Default)]
    struct Recorder {
        notices: Mutex<Vec<UsageNotice>>,
    }

    #[async_trait]
    impl UsageNotifier for Recorder {
        async fn notify(&self, notice: &UsageNotice) -> Result<(), NotifyError> {
            self.notices.lock().await.push(notice.clone());
            Ok(())
        }
    }

    async fn archive_n(store: &InMemoryKnowledgeStore, org: Uuid, user: Uuid, n: usize) {
        for i in 0..n {
            let item = NewKnowledgeItem {
                organization_id: org,
                title: "Thread".into(),
                content: vec![],
                summary: "Summary unavailable.".into(),
                action_items: vec![],
                embedding: vec![0.1],
                source_type: Platform::Slack,
                channel_id: "C1".into(),
                channel_name: "general".into(),
                thread_id: format!("{}.{i:03}", store.items().await.len()),
                root_message_author: "U1".into(),
                created_by_id: user,
            };
            store.insert_knowledge_item(&item).await.unwrap();
        }
    }

    #[test]
    fn month_start_is_first_midnight_utc() {
        assert_eq!(
            month_start(datetime!(2024-03-17 15:42:10 UTC)),
            datetime!(2024-03-01 0:00 UTC)
        );
        assert_eq!(
            month_start(datetime!(2024-03-01 0:00 UTC)),
            datetime!(2024-03-01 0:00 UTC)
        );
        // Converted to UTC before truncating
        assert_eq!(
            month_start(datetime!(2024-04-01 1:00 +2)),
            datetime!(2024-03-01 0:00 UTC)
        );
    }

    #[test]
    fn levels_apply_at_or_above_thresholds() {
        assert_eq!(usage_level(Plan::Free, 19), None);
        assert_eq!(usage_level(Plan::Free, 20), Some(UsageLevel::Approaching));
        assert_eq!(usage_level(Plan::Free, 21), Some(UsageLevel::Approaching));
        assert_eq!(usage_level(Plan::Free, 25), Some(UsageLevel::Reached));
        assert_eq!(usage_level(Plan::Free, 30), Some(UsageLevel::Reached));
        assert_eq!(usage_level(Plan::Pro, 400), Some(UsageLevel::Approaching));
        assert_eq!(usage_level(Plan::Enterprise, 1_000_000), None);
    }

    #[tokio::test]
    async fn count_skipping_past_threshold_still_warns_once() {
        let store = InMemoryKnowledgeStore::new();
        let notifier = Recorder::default();
        let org = store.add_organization("Acme", Plan::Free).await;
        let owner = store.add_member(org, "owner@acme.test", true).await;
        let now = OffsetDateTime::now_utc();

        // Two concurrent jobs inserted before either counted, so 20 is never seen
        archive_n(&store, org, owner, 21).await;
        let notice = check_usage(&store, &notifier, org, now).await.unwrap();
        assert_eq!(notice.map(|n| n.level), Some(UsageLevel::Approaching));
        assert!(check_usage(&store, &notifier, org, now).await.unwrap().is_none());

        archive_n(&store, org, owner, 5).await;
        let notice = check_usage(&store, &notifier, org, now).await.unwrap().unwrap();
        assert_eq!(notice.level, UsageLevel::Reached);
        assert_eq!(notice.used, 26);
        assert!(check_usage(&store, &notifier, org, now).await.unwrap().is_none());

        let sent: Vec<UsageLevel> = notifier.notices.lock().await.iter().map(|n| n.level).collect();
        assert_eq!(sent, vec![UsageLevel::Approaching, UsageLevel::Reached]);
    }

    #[tokio::test]
    async fn concurrent_checks_send_one_notice() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let notifier = Arc::new(Recorder::default());
        let org = store.add_organization("Acme", Plan::Free).await;
        let owner = store.add_member(org, "owner@acme.test", true).await;
        archive_n(&store, org, owner, 22).await;
        let now = OffsetDateTime::now_utc();

        let checks: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let notifier = notifier.clone();
                tokio::spawn(async move {
                    check_usage(store.as_ref(), notifier.as_ref(), org, now)
                        .await
                        .unwrap()
                })
            })
            .collect();
        for check in checks {
            check.await.unwrap();
        }

        assert_eq!(notifier.notices.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn each_month_gets_its_own_notices() {
        let store = InMemoryKnowledgeStore::new();
        let org = store.add_organization("Acme", Plan::Free).await;
        let march = datetime!(2024-03-01 0:00 UTC);
        let april = datetime!(2024-04-01 0:00 UTC);

        assert!(store.claim_usage_notice(org, march, UsageLevel::Approaching).await.unwrap());
        assert!(!store.claim_usage_notice(org, march, UsageLevel::Approaching).await.unwrap());
        assert!(store.claim_usage_notice(org, march, UsageLevel::Reached).await.unwrap());
        assert!(store.claim_usage_notice(org, april, UsageLevel::Approaching).await.unwrap());
    }
}
