//! Durable job queue
//!
//! Jobs are JSON payloads wrapped in a [`JobEnvelope`]. Each queue carries a
//! declarative [`RetryPolicy`]: how many attempts a job gets, how long to wait
//! between attempts, how long a job id is remembered for deduplication, and how
//! many permanently failed jobs are retained for operator inspection.
//!
//! Two backends implement [`JobQueue`]:
//! - [`RedisQueue`] for production (survives process restarts)
//! - [`MemoryQueue`] for tests and single-process development

mod consumer;
mod memory;
mod redis;

pub use consumer::{JobAttempt, JobError, JobHandler, QueueConsumer};
pub use memory::MemoryQueue;
pub use self::redis::RedisQueue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::QueueResult;

/// A job as stored in, and handed out by, a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Number of attempts that have already failed.
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    pub last_error: Option<String>,
}

impl JobEnvelope {
    pub fn new(queue: &str, id: String, payload: serde_json::Value) -> Self {
        Self {
            id,
            queue: queue.to_string(),
            payload,
            attempts: 0,
            enqueued_at: OffsetDateTime::now_utc(),
            last_error: None,
        }
    }

    /// Deserialize the payload into the job type the handler expects.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// The attempt currently running, starting at 1.
    pub fn current_attempt(&self) -> u32 {
        self.attempts + 1
    }
}

/// A job that exhausted its retry budget or failed permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub job: JobEnvelope,
    pub error: String,
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
}

/// Error recorded against a job whose lease ran out before it was acknowledged.
pub const LEASE_EXPIRED: &str = "lease expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job with the same id was seen within the dedupe window; nothing was added.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The job was rescheduled and becomes visible again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// The job moved to the failed set.
    Parked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(20);
                base.saturating_mul(1u32 << exponent).min(max)
            }
        }
    }
}

/// Declarative retry and retention policy for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Failed jobs kept for inspection; older entries are trimmed.
    pub failed_retention: usize,
    /// How long an explicit job id blocks re-enqueueing the same id.
    pub dedupe_ttl: Duration,
    /// How long a reserved job may run before it is considered stalled and handed out again.
    pub lease: Duration,
}

impl RetryPolicy {
    /// Policy for chat-thread archival jobs.
    pub fn archival() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(10),
                max: Duration::from_secs(300),
            },
            failed_retention: 1_000,
            dedupe_ttl: Duration::from_secs(24 * 60 * 60),
            lease: Duration::from_secs(10 * 60),
        }
    }

    /// Policy for Stripe webhook jobs. The dedupe window covers Stripe's
    /// three-day redelivery schedule.
    pub fn billing() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(2),
                max: Duration::from_secs(60),
            },
            failed_retention: 500,
            dedupe_ttl: Duration::from_secs(72 * 60 * 60),
            lease: Duration::from_secs(5 * 60),
        }
    }

    /// Whether a job that just failed `attempt` (1-based) gets another try.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::archival()
    }
}

/// Queue operations shared by every backend.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    fn policy(&self) -> &RetryPolicy;

    /// Add a job. When `job_id` is given and was already seen within the
    /// dedupe window, nothing is added and `Duplicate` is returned.
    async fn enqueue(
        &self,
        job_id: Option<&str>,
        payload: serde_json::Value,
    ) -> QueueResult<EnqueueOutcome>;

    /// Take the next ready job, if any, and lease it to the caller.
    async fn reserve(&self) -> QueueResult<Option<JobEnvelope>>;

    /// Acknowledge a job as done.
    async fn complete(&self, job: &JobEnvelope) -> QueueResult<()>;

    /// Record a failed attempt. Retryable failures are rescheduled while the
    /// policy allows it; everything else is parked in the failed set.
    async fn fail(
        &self,
        job: &JobEnvelope,
        error: &str,
        retryable: bool,
    ) -> QueueResult<FailureOutcome>;

    /// Most recent permanently failed jobs, newest first.
    async fn failed_jobs(&self, limit: usize) -> QueueResult<Vec<FailedJob>>;

    async fn counts(&self) -> QueueResult<QueueCounts>;

    /// Stop handing out jobs. Further calls return `QueueError::Closed`.
    async fn close(&self);
}

/// Serialize `job` and enqueue it.
pub async fn enqueue_job<T: Serialize + ?Sized>(
    queue: &dyn JobQueue,
    job_id: Option<&str>,
    job: &T,
) -> QueueResult<EnqueueOutcome> {
    let payload = serde_json::to_value(job)?;
    queue.enqueue(job_id, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
        };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
        assert_eq!(backoff.delay_for(10), Duration::from_secs(60));
    }

    #[test]
    fn retry_budget_is_bounded() {
        let policy = RetryPolicy::billing();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let job = JobEnvelope::new("billing", "evt_1".into(), serde_json::json!({"a": 1}));
        let json = serde_json::to_string(&job).unwrap();
        let back: JobEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "evt_1");
        assert_eq!(back.current_attempt(), 1);
    }
}
