//! Redis queue backend
//!
//! Key layout for a queue named `archival` under prefix `threadbase`:
//!
//! | key | type | contents |
//! |---|---|---|
//! | `threadbase:archival:ready` | list | job ids ready to run |
//! | `threadbase:archival:delayed` | zset | job ids scored by retry time (ms) |
//! | `threadbase:archival:processing` | zset | leased job ids scored by lease deadline (ms) |
//! | `threadbase:archival:jobs` | hash | job id -> serialized envelope |
//! | `threadbase:archival:failed` | list | serialized failed jobs, newest first, capped |
//! | `threadbase:archival:reclaims` | hash | job id -> lease expiries since the envelope was last written |
//! | `threadbase:archival:dedupe:{id}` | string | present while the id is in its dedupe window |

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::{
    EnqueueOutcome, FailedJob, FailureOutcome, JobEnvelope, JobQueue, QueueCounts, RetryPolicy,
    LEASE_EXPIRED,
};
use crate::error::{QueueError, QueueResult};

/// Write the job and claim its dedupe key in one step. The key is claimed
/// last so a failed write leaves the id free for redelivery.
const ENQUEUE_SCRIPT: &str = r#"
local dedupe = KEYS[1]
local jobs = KEYS[2]
local ready = KEYS[3]
local id = ARGV[1]
local body = ARGV[2]
local ttl = tonumber(ARGV[3])

if ttl > 0 and redis.call('EXISTS', dedupe) == 1 then
  return 0
end

redis.call('HSET', jobs, id, body)
redis.call('RPUSH', ready, id)
if ttl > 0 then
  redis.call('SET', dedupe, 1, 'EX', ttl)
end
return 1
"#;

/// Promote due retries, reclaim expired leases, then lease the next ready job.
///
/// Each reclaimed lease counts as a failed attempt, tallied in the reclaims
/// hash so the stored envelope is never re-encoded here. Once the attempt
/// budget is spent the job is parked in the failed list with its reclaim
/// tally alongside. Returns `{envelope, reclaims}` or nil.
const RESERVE_SCRIPT: &str = r#"
local ready = KEYS[1]
local delayed = KEYS[2]
local processing = KEYS[3]
local jobs = KEYS[4]
local failed = KEYS[5]
local reclaims = KEYS[6]
local now = tonumber(ARGV[1])
local lease = tonumber(ARGV[2])
local max_attempts = tonumber(ARGV[3])
local keep = tonumber(ARGV[4])
local failed_at = ARGV[5]

local due = redis.call('ZRANGEBYSCORE', delayed, '-inf', now)
for _, id in ipairs(due) do
  redis.call('ZREM', delayed, id)
  redis.call('RPUSH', ready, id)
end

local stalled = redis.call('ZRANGEBYSCORE', processing, '-inf', now)
for _, id in ipairs(stalled) do
  redis.call('ZREM', processing, id)
  local body = redis.call('HGET', jobs, id)
  if body then
    local expired = redis.call('HINCRBY', reclaims, id, 1)
    local attempts = (cjson.decode(body)['attempts'] or 0) + expired
    if attempts < max_attempts then
      redis.call('RPUSH', ready, id)
    else
      redis.call('HDEL', jobs, id)
      redis.call('HDEL', reclaims, id)
      local entry = '{"job":' .. body .. ',"error":"lease expired","failed_at":'
        .. cjson.encode(failed_at) .. ',"reclaims":' .. expired .. '}'
      redis.call('LPUSH', failed, entry)
      redis.call('LTRIM', failed, 0, keep)
    end
  else
    redis.call('HDEL', reclaims, id)
  end
end

while true do
  local id = redis.call('LPOP', ready)
  if not id then
    return false
  end
  local body = redis.call('HGET', jobs, id)
  if body then
    redis.call('ZADD', processing, now + lease, id)
    local expired = tonumber(redis.call('HGET', reclaims, id) or 0)
    return {body, expired}
  end
end
"#;

/// Failed-list entry as written by `fail` or by lease reclaim.
#[derive(Deserialize)]
struct StoredFailedJob {
    #[serde(flatten)]
    failed: FailedJob,
    #[serde(default)]
    reclaims: u32,
}

impl StoredFailedJob {
    fn into_failed_job(self) -> FailedJob {
        let mut failed = self.failed;
        apply_reclaims(&mut failed.job, self.reclaims);
        failed
    }
}

/// Fold lease expiries recorded outside the envelope into its attempt count.
fn apply_reclaims(job: &mut JobEnvelope, reclaims: u32) {
    if reclaims > 0 {
        job.attempts += reclaims;
        job.last_error = Some(LEASE_EXPIRED.to_string());
    }
}

fn failed_at_stamp() -> QueueResult<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| QueueError::Clock(e.to_string()))
}

pub struct RedisQueue {
    conn: ConnectionManager,
    name: String,
    policy: RetryPolicy,
    keys: Keys,
    enqueue_script: Script,
    reserve_script: Script,
    closed: AtomicBool,
}

struct Keys {
    base: String,
    ready: String,
    delayed: String,
    processing: String,
    jobs: String,
    failed: String,
    reclaims: String,
}

impl Keys {
    fn new(prefix: &str, name: &str) -> Self {
        let base = format!("{prefix}:{name}");
        Self {
            ready: format!("{base}:ready"),
            delayed: format!("{base}:delayed"),
            processing: format!("{base}:processing"),
            jobs: format!("{base}:jobs"),
            failed: format!("{base}:failed"),
            reclaims: format!("{base}:reclaims"),
            base,
        }
    }

    fn dedupe(&self, job_id: &str) -> String {
        format!("{}:dedupe:{job_id}", self.base)
    }
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

impl RedisQueue {
    pub fn new(
        conn: ConnectionManager,
        prefix: &str,
        name: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        let name = name.into();
        Self {
            conn,
            keys: Keys::new(prefix, &name),
            name,
            policy,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            reserve_script: Script::new(RESERVE_SCRIPT),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a connection manager for `redis_url`.
    pub async fn connect(redis_url: &str) -> QueueResult<ConnectionManager> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        tracing::info!("Connected to Redis");
        Ok(manager)
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed(self.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
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
        self.ensure_open()?;
        let mut conn = self.conn.clone();

        let (id, dedupe_ttl) = match job_id {
            Some(id) => (id.to_string(), self.policy.dedupe_ttl.as_secs().max(1)),
            None => (uuid::Uuid::new_v4().to_string(), 0),
        };

        let envelope = JobEnvelope::new(&self.name, id.clone(), payload);
        let body = serde_json::to_string(&envelope)?;

        let written: i64 = self
            .enqueue_script
            .key(self.keys.dedupe(&id))
            .key(&self.keys.jobs)
            .key(&self.keys.ready)
            .arg(&id)
            .arg(body)
            .arg(dedupe_ttl)
            .invoke_async(&mut conn)
            .await?;

        if written == 0 {
            tracing::debug!(queue = %self.name, job_id = %id, "Duplicate job ignored");
            return Ok(EnqueueOutcome::Duplicate);
        }

        tracing::debug!(queue = %self.name, job_id = %id, "Job enqueued");
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn reserve(&self) -> QueueResult<Option<JobEnvelope>> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();

        let reserved: Option<(String, u32)> = self
            .reserve_script
            .key(&self.keys.ready)
            .key(&self.keys.delayed)
            .key(&self.keys.processing)
            .key(&self.keys.jobs)
            .key(&self.keys.failed)
            .key(&self.keys.reclaims)
            .arg(now_ms())
            .arg(self.policy.lease.as_millis() as i64)
            .arg(self.policy.max_attempts)
            .arg(self.policy.failed_retention.max(1) as i64 - 1)
            .arg(failed_at_stamp()?)
            .invoke_async(&mut conn)
            .await?;

        match reserved {
            Some((body, reclaims)) => {
                let mut job: JobEnvelope = serde_json::from_str(&body)?;
                if reclaims > 0 {
                    tracing::warn!(
                        queue = %self.name,
                        job_id = %job.id,
                        reclaims,
                        "Reclaimed stalled job"
                    );
                }
                apply_reclaims(&mut job, reclaims);
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, job: &JobEnvelope) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let (removed, _, _): (i64, i64, i64) = redis::pipe()
            .atomic()
            .zrem(&self.keys.processing, &job.id)
            .hdel(&self.keys.jobs, &job.id)
            .hdel(&self.keys.reclaims, &job.id)
            .query_async(&mut conn)
            .await?;

        if removed == 0 {
            return Err(QueueError::NotReserved(job.id.clone()));
        }
        Ok(())
    }

    async fn fail(
        &self,
        job: &JobEnvelope,
        error: &str,
        retryable: bool,
    ) -> QueueResult<FailureOutcome> {
        let mut conn = self.conn.clone();

        let removed: i64 = redis::cmd("ZREM")
            .arg(&self.keys.processing)
            .arg(&job.id)
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            return Err(QueueError::NotReserved(job.id.clone()));
        }

        let attempt = job.current_attempt();
        let mut next = job.clone();
        next.attempts = attempt;
        next.last_error = Some(error.to_string());

        if retryable && self.policy.should_retry(attempt) {
            let delay = self.policy.backoff.delay_for(attempt);
            let run_at = now_ms() + delay.as_millis() as i64;
            let body = serde_json::to_string(&next)?;

            let _: () = redis::pipe()
                .atomic()
                .hset(&self.keys.jobs, &job.id, body)
                .ignore()
                .zadd(&self.keys.delayed, &job.id, run_at)
                .ignore()
                .hdel(&self.keys.reclaims, &job.id)
                .ignore()
                .query_async(&mut conn)
                .await?;

            return Ok(FailureOutcome::Retrying { attempt, delay });
        }

        let failed = FailedJob {
            job: next,
            error: error.to_string(),
            failed_at: OffsetDateTime::now_utc(),
        };
        let body = serde_json::to_string(&failed)?;
        let keep = self.policy.failed_retention.max(1) as isize - 1;

        let _: () = redis::pipe()
            .atomic()
            .hdel(&self.keys.jobs, &job.id)
            .ignore()
            .hdel(&self.keys.reclaims, &job.id)
            .ignore()
            .lpush(&self.keys.failed, body)
            .ignore()
            .ltrim(&self.keys.failed, 0, keep)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(FailureOutcome::Parked)
    }

    async fn failed_jobs(&self, limit: usize) -> QueueResult<Vec<FailedJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let bodies: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.keys.failed)
            .arg(0)
            .arg(limit as isize - 1)
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(bodies.len());
        for body in bodies {
            match serde_json::from_str::<StoredFailedJob>(&body) {
                Ok(stored) => jobs.push(stored.into_failed_job()),
                Err(e) => {
                    tracing::warn!(queue = %self.name, error = %e, "Skipping unreadable failed job");
                }
            }
        }
        Ok(jobs)
    }

    async fn counts(&self) -> QueueResult<QueueCounts> {
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, failed): (u64, u64, u64, u64) = redis::pipe()
            .llen(&self.keys.ready)
            .zcard(&self.keys.delayed)
            .zcard(&self.keys.processing)
            .llen(&self.keys.failed)
            .query_async(&mut conn)
            .await?;

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            failed,
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        tracing::info!(queue = %self.name, "Queue closed");
    }
}
