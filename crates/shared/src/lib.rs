// Shared crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Threadbase shared infrastructure
//!
//! Pieces used by both the API ingress and the background worker:
//!
//! - **Queue**: durable job queue with declarative retry policy (Redis and in-memory backends)
//! - **Consumer**: bounded-concurrency queue consumer with graceful drain
//! - **Rate limiting**: sliding-window limiter for webhook ingress
//! - **Plans**: plan catalogue and monthly archive limits
//! - **Database**: Postgres pool creation and embedded migrations

pub mod db;
pub mod error;
pub mod plan;
pub mod queue;
pub mod rate_limit;

pub use db::{create_pool, run_migrations};
pub use error::{QueueError, QueueResult};
pub use plan::{Plan, UnknownPlan};
pub use queue::{
    enqueue_job, Backoff, EnqueueOutcome, FailedJob, FailureOutcome, JobAttempt, JobEnvelope,
    JobError, JobHandler, JobQueue, MemoryQueue, QueueConsumer, QueueCounts, RedisQueue,
    RetryPolicy, LEASE_EXPIRED,
};
pub use rate_limit::{spawn_cleanup, RateLimitConfig, RateLimitResult, RateLimiter};
