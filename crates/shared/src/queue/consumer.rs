//! Queue consumer runtime
//!
//! Polls a [`JobQueue`], runs a [`JobHandler`] for each job with bounded
//! concurrency, and reports the outcome back to the queue so its retry policy
//! applies. On shutdown no new jobs are reserved and in-flight jobs are drained.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{FailureOutcome, JobEnvelope, JobQueue};
use crate::error::{QueueError, QueueResult};

/// Outcome classification a handler returns for a failed job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// Transient failure; the queue retries while the policy allows it.
    #[error("{0}")]
    Retryable(String),

    /// The job can never succeed; it goes straight to the failed set.
    #[error("{0}")]
    Permanent(String),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }
}

/// Which attempt a handler is running, so it can tell whether a failure is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobAttempt {
    /// 1-based.
    pub number: u32,
    pub max: u32,
}

impl JobAttempt {
    pub fn is_last(&self) -> bool {
        self.number >= self.max
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn handle(&self, job: &JobEnvelope, attempt: JobAttempt) -> Result<(), JobError>;
}

pub struct QueueConsumer {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    poll_interval: Duration,
}

impl QueueConsumer {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            queue,
            handler,
            concurrency: 5,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Consume until `shutdown` fires or the queue is closed, then wait for
    /// in-flight jobs to finish.
    pub async fn run(&self, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        tracing::info!(
            queue = %self.queue.name(),
            handler = self.handler.name(),
            concurrency = self.concurrency,
            "Queue consumer started"
        );

        loop {
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    tracing::error!(queue = %self.queue.name(), error = %e, "Job task panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.reserve().await {
                Ok(Some(job)) => {
                    let queue = Arc::clone(&self.queue);
                    let handler = Arc::clone(&self.handler);
                    tasks.spawn(async move {
                        process_job(queue.as_ref(), handler.as_ref(), job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(QueueError::Closed(_)) => break,
                Err(e) => {
                    drop(permit);
                    tracing::warn!(queue = %self.queue.name(), error = %e, "Failed to reserve job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval * 4) => {}
                    }
                }
            }
        }

        tracing::info!(
            queue = %self.queue.name(),
            in_flight = tasks.len(),
            "Queue consumer stopping, draining in-flight jobs"
        );
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(queue = %self.queue.name(), error = %e, "Job task panicked");
            }
        }
        tracing::info!(queue = %self.queue.name(), "Queue consumer stopped");
    }

    /// Process ready jobs one at a time until none are left. Returns how many
    /// jobs were handled. Delayed retries are not waited for.
    pub async fn drain(&self) -> QueueResult<usize> {
        let mut handled = 0;
        while let Some(job) = self.queue.reserve().await? {
            process_job(self.queue.as_ref(), self.handler.as_ref(), job).await;
            handled += 1;
        }
        Ok(handled)
    }
}

async fn process_job(queue: &dyn JobQueue, handler: &dyn JobHandler, job: JobEnvelope) {
    let attempt = JobAttempt {
        number: job.current_attempt(),
        max: queue.policy().max_attempts,
    };

    tracing::debug!(
        queue = %queue.name(),
        job_id = %job.id,
        attempt = attempt.number,
        "Processing job"
    );

    match handler.handle(&job, attempt).await {
        Ok(()) => {
            if let Err(e) = queue.complete(&job).await {
                tracing::error!(queue = %queue.name(), job_id = %job.id, error = %e, "Failed to ack job");
            } else {
                tracing::info!(queue = %queue.name(), job_id = %job.id, "Job completed");
            }
        }
        Err(job_error) => {
            let message = job_error.to_string();
            match queue.fail(&job, &message, job_error.is_retryable()).await {
                Ok(FailureOutcome::Retrying { attempt, delay }) => {
                    tracing::warn!(
                        queue = %queue.name(),
                        job_id = %job.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %message,
                        "Job failed, will retry"
                    );
                }
                Ok(FailureOutcome::Parked) => {
                    tracing::error!(
                        queue = %queue.name(),
                        job_id = %job.id,
                        attempt = attempt.number,
                        error = %message,
                        "Job failed permanently"
                    );
                }
                Err(e) => {
                    tracing::error!(queue = %queue.name(), job_id = %job.id, error = %e, "Failed to record job failure");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryQueue, RetryPolicy};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
        permanent: bool,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn handle(&self, _job: &JobEnvelope, _attempt: JobAttempt) -> Result<(), JobError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                if self.permanent {
                    return Err(JobError::Permanent("bad".into()));
                }
                return Err(JobError::Retryable("try again".into()));
            }
            Ok(())
        }
    }

    fn setup(fail_first: u32, permanent: bool) -> (Arc<MemoryQueue>, Arc<Flaky>, QueueConsumer) {
        let queue = Arc::new(MemoryQueue::new("test", RetryPolicy::archival()));
        let handler = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first,
            permanent,
        });
        let consumer = QueueConsumer::new(queue.clone(), handler.clone());
        (queue, handler, consumer)
    }

    #[tokio::test]
    async fn successful_job_is_completed() {
        let (queue, handler, consumer) = setup(0, false);
        queue.enqueue(None, json!({})).await.unwrap();
        assert_eq!(consumer.drain().await.unwrap(), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.counts().await.unwrap().active, 0);
    }

    #[tokio::test]
    async fn retryable_error_is_retried_until_success() {
        let (queue, handler, consumer) = setup(2, false);
        queue.enqueue(Some("j"), json!({})).await.unwrap();

        consumer.drain().await.unwrap();
        queue.release_delayed().await;
        consumer.drain().await.unwrap();
        queue.release_delayed().await;
        consumer.drain().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.counts().await.unwrap().failed, 0);
    }

    #[tokio::test]
    async fn permanent_error_is_parked_after_one_attempt() {
        let (queue, handler, consumer) = setup(5, true);
        queue.enqueue(Some("j"), json!({})).await.unwrap();

        consumer.drain().await.unwrap();
        queue.release_delayed().await;
        consumer.drain().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.counts().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (queue, handler, consumer) = setup(0, false);
        queue.enqueue(None, json!({})).await.unwrap();

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let consumer = consumer.with_poll_interval(Duration::from_millis(10));
        let task = tokio::spawn(async move { consumer.run(token).await });

        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn last_attempt_is_detected() {
        assert!(!JobAttempt { number: 2, max: 3 }.is_last());
        assert!(JobAttempt { number: 3, max: 3 }.is_last());
    }
}
