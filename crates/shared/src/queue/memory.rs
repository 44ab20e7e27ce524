//! In-process queue backend
//!
//! Same semantics as [`super::RedisQueue`] (dedupe window, delayed retries,
//! leases, capped failed set) but held in memory. Used by tests and by the API
//! when no Redis URL is configured in development.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{
    EnqueueOutcome, FailedJob, FailureOutcome, JobEnvelope, JobQueue, QueueCounts, RetryPolicy,
    LEASE_EXPIRED,
};
use crate::error::{QueueError, QueueResult};

#[derive(Default)]
struct State {
    ready: VecDeque<JobEnvelope>,
    delayed: Vec<(Instant, JobEnvelope)>,
    in_flight: HashMap<String, (Instant, JobEnvelope)>,
    failed: VecDeque<FailedJob>,
    /// Explicit job ids and when they stop blocking re-enqueue.
    seen: HashMap<String, Instant>,
    closed: bool,
}

impl State {
    fn promote(&mut self, now: Instant, policy: &RetryPolicy) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, job) = self.delayed.swap_remove(i);
                self.ready.push_back(job);
            } else {
                i += 1;
            }
        }

        let stalled: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stalled {
            let Some((_, mut job)) = self.in_flight.remove(&id) else {
                continue;
            };
            // An expired lease counts as a failed attempt
            job.attempts = job.current_attempt();
            job.last_error = Some(LEASE_EXPIRED.to_string());

            if policy.should_retry(job.attempts) {
                tracing::warn!(
                    queue = %job.queue,
                    job_id = %id,
                    attempt = job.attempts,
                    "Reclaiming stalled job"
                );
                self.ready.push_back(job);
            } else {
                tracing::error!(
                    queue = %job.queue,
                    job_id = %id,
                    attempts = job.attempts,
                    "Stalled job exhausted its attempts, parking"
                );
                self.failed.push_front(FailedJob {
                    job,
                    error: LEASE_EXPIRED.to_string(),
                    failed_at: OffsetDateTime::now_utc(),
                });
                self.failed.truncate(policy.failed_retention);
            }
        }

        self.seen.retain(|_, expires| *expires > now);
    }
}

pub struct MemoryQueue {
    name: String,
    policy: RetryPolicy,
    state: Mutex<State>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            state: Mutex::new(State::default()),
        }
    }

    /// Make every delayed retry ready immediately.
    pub async fn release_delayed(&self) {
        let mut state = self.state.lock().await;
        let delayed = std::mem::take(&mut state.delayed);
        state.ready.extend(delayed.into_iter().map(|(_, job)| job));
    }

    /// Snapshot of the jobs waiting to run, in order.
    pub async fn ready_jobs(&self) -> Vec<JobEnvelope> {
        self.state.lock().await.ready.iter().cloned().collect()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn enqueue(
        &self,
        job_id: Option<&str>,
        payload: serde_json::Value,
    ) -> QueueResult<EnqueueOutcome> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed(self.name.clone()));
        }
        let now = Instant::now();
        state.promote(now, &self.policy);

        let id = match job_id {
            Some(id) => {
                if state.seen.contains_key(id) {
                    tracing::debug!(queue = %self.name, job_id = %id, "Duplicate job ignored");
                    return Ok(EnqueueOutcome::Duplicate);
                }
                state
                    .seen
                    .insert(id.to_string(), now + self.policy.dedupe_ttl);
                id.to_string()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        state
            .ready
            .push_back(JobEnvelope::new(&self.name, id, payload));
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn reserve(&self) -> QueueResult<Option<JobEnvelope>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed(self.name.clone()));
        }
        let now = Instant::now();
        state.promote(now, &self.policy);

        let Some(job) = state.ready.pop_front() else {
            return Ok(None);
        };
        state
            .in_flight
            .insert(job.id.clone(), (now + self.policy.lease, job.clone()));
        Ok(Some(job))
    }

    async fn complete(&self, job: &JobEnvelope) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&job.id)
            .map(|_| ())
            .ok_or_else(|| QueueError::NotReserved(job.id.clone()))
    }

    async fn fail(
        &self,
        job: &JobEnvelope,
        error: &str,
        retryable: bool,
    ) -> QueueResult<FailureOutcome> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(&job.id).is_none() {
            return Err(QueueError::NotReserved(job.id.clone()));
        }

        let attempt = job.current_attempt();
        let mut next = job.clone();
        next.attempts = attempt;
        next.last_error = Some(error.to_string());

        if retryable && self.policy.should_retry(attempt) {
            let delay = self.policy.backoff.delay_for(attempt);
            state.delayed.push((Instant::now() + delay, next));
            return Ok(FailureOutcome::Retrying { attempt, delay });
        }

        state.failed.push_front(FailedJob {
            job: next,
            error: error.to_string(),
            failed_at: OffsetDateTime::now_utc(),
        });
        state.failed.truncate(self.policy.failed_retention);
        Ok(FailureOutcome::Parked)
    }

    async fn failed_jobs(&self, limit: usize) -> QueueResult<Vec<FailedJob>> {
        let state = self.state.lock().await;
        Ok(state.failed.iter().take(limit).cloned().collect())
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        let state = self.state.lock().await;
        Ok(QueueCounts {
            waiting: state.ready.len() as u64,
            delayed: state.delayed.len() as u64,
            active: state.in_flight.len() as u64,
            failed: state.failed.len() as u64,
        })
    }

    async fn close(&self) {
        self.state.lock().await.closed = true;
        tracing::info!(queue = %self.name, "Queue closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use serde_json::json;

    fn queue() -> MemoryQueue {
        MemoryQueue::new("test", RetryPolicy::billing())
    }

    #[tokio::test]
    async fn duplicate_job_id_is_ignored() {
        let q = queue();
        assert_eq!(
            q.enqueue(Some("evt_1"), json!({})).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            q.enqueue(Some("evt_1"), json!({})).await.unwrap(),
            EnqueueOutcome::Duplicate
        );
        assert_eq!(q.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn anonymous_jobs_are_never_deduplicated() {
        let q = queue();
        q.enqueue(None, json!({"n": 1})).await.unwrap();
        q.enqueue(None, json!({"n": 1})).await.unwrap();
        assert_eq!(q.counts().await.unwrap().waiting, 2);
    }

    #[tokio::test]
    async fn completed_job_leaves_the_queue() {
        let q = queue();
        q.enqueue(Some("a"), json!({})).await.unwrap();
        let job = q.reserve().await.unwrap().unwrap();
        assert_eq!(q.counts().await.unwrap().active, 1);
        q.complete(&job).await.unwrap();
        assert_eq!(q.counts().await.unwrap(), QueueCounts::default());
        assert!(q.reserve().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retryable_failure_is_delayed_then_parked_after_budget() {
        let q = queue();
        q.enqueue(Some("a"), json!({})).await.unwrap();

        let job = q.reserve().await.unwrap().unwrap();
        let outcome = q.fail(&job, "boom", true).await.unwrap();
        assert!(matches!(outcome, FailureOutcome::Retrying { attempt: 1, .. }));
        assert!(q.reserve().await.unwrap().is_none());

        q.release_delayed().await;
        let job = q.reserve().await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        q.fail(&job, "boom", true).await.unwrap();

        q.release_delayed().await;
        let job = q.reserve().await.unwrap().unwrap();
        assert_eq!(job.current_attempt(), 3);
        assert_eq!(
            q.fail(&job, "boom", true).await.unwrap(),
            FailureOutcome::Parked
        );

        let failed = q.failed_jobs(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job.attempts, 3);
    }

    #[tokio::test]
    async fn stalled_job_is_parked_once_attempts_run_out() {
        let mut policy = RetryPolicy::billing();
        policy.lease = Duration::from_millis(1);
        let q = MemoryQueue::new("stalled", policy);
        q.enqueue(Some("hung"), json!({})).await.unwrap();

        // Reserve and never acknowledge, as a worker that died mid-job would
        let mut handed_out = 0;
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Some(job) = q.reserve().await.unwrap() {
                handed_out += 1;
                assert!(job.current_attempt() <= policy.max_attempts);
                if job.attempts > 0 {
                    assert_eq!(job.last_error.as_deref(), Some(LEASE_EXPIRED));
                }
            }
        }
        assert_eq!(handed_out, policy.max_attempts);

        let counts = q.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.waiting + counts.active + counts.delayed, 0);

        let failed = q.failed_jobs(10).await.unwrap();
        assert_eq!(failed[0].job.id, "hung");
        assert_eq!(failed[0].job.attempts, policy.max_attempts);
        assert_eq!(failed[0].error, LEASE_EXPIRED);
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let q = queue();
        q.enqueue(Some("a"), json!({})).await.unwrap();
        let job = q.reserve().await.unwrap().unwrap();
        assert_eq!(
            q.fail(&job, "bad input", false).await.unwrap(),
            FailureOutcome::Parked
        );
        assert_eq!(q.counts().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn failed_set_is_capped() {
        let mut policy = RetryPolicy::billing();
        policy.failed_retention = 2;
        let q = MemoryQueue::new("capped", policy);
        for i in 0..3 {
            q.enqueue(Some(&format!("job-{i}")), json!({})).await.unwrap();
            let job = q.reserve().await.unwrap().unwrap();
            q.fail(&job, "nope", false).await.unwrap();
        }
        let failed = q.failed_jobs(10).await.unwrap();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].job.id, "job-2");
    }

    #[tokio::test]
    async fn closed_queue_rejects_work() {
        let q = queue();
        q.close().await;
        assert!(matches!(
            q.enqueue(None, json!({})).await,
            Err(QueueError::Closed(_))
        ));
        assert!(matches!(q.reserve().await, Err(QueueError::Closed(_))));
    }

    #[tokio::test]
    async fn completing_unknown_job_is_an_error() {
        let q = queue();
        let job = JobEnvelope::new("test", "ghost".into(), json!({}));
        assert!(matches!(
            q.complete(&job).await,
            Err(QueueError::NotReserved(_))
        ));
    }
}
