//! Archive ingress through the queue to a stored knowledge item.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::json;
use threadbase_api::{create_router, AppState};
use threadbase_archival::{
    AiClient, AiError, ArchivalWorker, InMemoryKnowledgeStore, KnowledgeStatus, LogErrorReporter,
    LogNotifier, Platform, PlatformError, PlatformRegistry, ThreadFetcher, ThreadLocation,
    ThreadMessage, ThreadReplier, ARCHIVAL_QUEUE,
};
use threadbase_billing::BILLING_QUEUE;
use threadbase_shared::{JobQueue, MemoryQueue, Plan, QueueConsumer, RateLimiter, RetryPolicy};
use tokio::sync::Mutex;
use tower::ServiceExt;

const SECRET: &str = "flow-secret";

struct OneMessageThread {
    replies: Mutex<Vec<String>>,
}

#[async_trait]
impl ThreadFetcher for OneMessageThread {
    async fn fetch_thread(
        &self,
        _token: &str,
        location: &ThreadLocation,
    ) -> Result<Vec<ThreadMessage>, PlatformError> {
        Ok(vec![ThreadMessage {
            author: "U1".to_string(),
            text: "Deploys are frozen until Friday".to_string(),
            timestamp: location.thread_id.clone(),
        }])
    }

    async fn channel_name(
        &self,
        _token: &str,
        _location: &ThreadLocation,
    ) -> Result<String, PlatformError> {
        Ok("general".to_string())
    }
}

#[async_trait]
impl ThreadReplier for OneMessageThread {
    async fn post_reply(
        &self,
        _token: &str,
        _location: &ThreadLocation,
        text: &str,
    ) -> Result<(), PlatformError> {
        self.replies.lock().await.push(text.to_string());
        Ok(())
    }
}

struct FixedAi;

#[async_trait]
impl AiClient for FixedAi {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, AiError> {
        Ok(vec![0.25; 8])
    }

    async fn summarize(&self, _messages: &[ThreadMessage]) -> Result<String, AiError> {
        Ok("Deploy freeze until Friday.".to_string())
    }

    async fn extract_action_items(
        &self,
        _messages: &[ThreadMessage],
    ) -> Result<Vec<String>, AiError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn archive_request_creates_one_knowledge_item() {
    // Ingress
    let archival = Arc::new(MemoryQueue::new(ARCHIVAL_QUEUE, RetryPolicy::archival()));
    let billing = Arc::new(MemoryQueue::new(BILLING_QUEUE, RetryPolicy::billing()));
    let state = AppState::new(
        archival.clone(),
        billing,
        Arc::new(RateLimiter::new_in_memory()),
        SECRET,
    );

    let request = Request::post("/api/archive")
        .header("authorization", format!("Bearer {SECRET}"))
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "source": "SLACK",
                "payload": {
                    "teamId": "T1",
                    "channelId": "C1",
                    "threadTs": "100.001",
                    "reactingUserId": "U1"
                }
            })
            .to_string(),
        ))
        .unwrap();

    let response = create_router(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["success"], true);

    // Worker
    let store = Arc::new(InMemoryKnowledgeStore::new());
    let org = store.add_organization("Acme", Plan::Pro).await;
    let owner = store.add_member(org, "owner@acme.test", true).await;
    store.link_account(org, Platform::Slack, "U1", owner).await;
    store
        .add_integration(Platform::Slack, "T1", org, "xoxb-test")
        .await;

    let slack = Arc::new(OneMessageThread {
        replies: Mutex::new(Vec::new()),
    });
    let worker = ArchivalWorker::new(
        store.clone(),
        PlatformRegistry::new().register(Platform::Slack, slack.clone()),
        Arc::new(FixedAi),
        Arc::new(LogErrorReporter),
        Arc::new(LogNotifier),
    );

    let processed = QueueConsumer::new(archival.clone(), Arc::new(worker))
        .drain()
        .await
        .unwrap();
    assert_eq!(processed, 1);

    let items = store.items().await;
    assert_eq!(items.len(), 1);
    let item = &items[0].item;
    assert_eq!(item.organization_id, org);
    assert_eq!(item.channel_id, "C1");
    assert_eq!(item.thread_id, "100.001");
    assert_eq!(item.created_by_id, owner);
    assert_eq!(item.summary, "Deploy freeze until Friday.");
    assert_eq!(items[0].status, KnowledgeStatus::Active);

    assert_eq!(slack.replies.lock().await.len(), 1);
    assert_eq!(archival.counts().await.unwrap().failed, 0);
}
