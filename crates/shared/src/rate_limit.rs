//! Sliding-window rate limiting
//!
//! Each key (a client IP for webhook ingress) may make `limit` requests in any
//! trailing `window`. Rejected requests do not consume capacity.
//!
//! The in-memory backend is per process; the Redis backend shares the window
//! across API replicas.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{RedisResult, Script};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Keys that have not been seen for this long are dropped by [`RateLimiter::cleanup`].
const IDLE_KEY_TTL: Duration = Duration::from_secs(300);

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
  redis.call('ZADD', key, now, member)
  count = count + 1
  allowed = 1
end
redis.call('PEXPIRE', key, window)

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ms = now
if oldest[2] then
  oldest_ms = tonumber(oldest[2])
end
return {allowed, count, oldest_ms}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    /// Stripe webhook ingress: 20 requests per 10 seconds per IP.
    pub fn webhook() -> Self {
        Self {
            limit: 20,
            window: Duration::from_secs(10),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::webhook()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// When the oldest counted request leaves the window.
    pub reset_at: OffsetDateTime,
    /// Zero when allowed.
    pub retry_after_seconds: u64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    backend: Backend,
}

enum Backend {
    InMemory(Mutex<HashMap<String, VecDeque<Instant>>>),
    Redis {
        conn: ConnectionManager,
        prefix: String,
        script: Script,
    },
}

impl RateLimiter {
    pub fn new_in_memory() -> Self {
        Self::in_memory(RateLimitConfig::default())
    }

    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self {
            config,
            backend: Backend::InMemory(Mutex::new(HashMap::new())),
        }
    }

    pub fn redis(conn: ConnectionManager, prefix: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            config,
            backend: Backend::Redis {
                conn,
                prefix: prefix.into(),
                script: Script::new(SLIDING_WINDOW_SCRIPT),
            },
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.backend, Backend::InMemory(_))
    }

    /// Number of keys with a window held in process. Always 0 for Redis.
    pub async fn tracked_keys(&self) -> usize {
        match &self.backend {
            Backend::InMemory(windows) => windows.lock().await.len(),
            Backend::Redis { .. } => 0,
        }
    }

    /// Record a request for `key` and report whether it is within the limit.
    pub async fn check(&self, key: &str) -> RedisResult<RateLimitResult> {
        match &self.backend {
            Backend::InMemory(windows) => {
                let mut windows = windows.lock().await;
                let hits = windows.entry(key.to_string()).or_default();
                Ok(check_window(hits, Instant::now(), self.config))
            }
            Backend::Redis {
                conn,
                prefix,
                script,
            } => {
                let mut conn = conn.clone();
                let now = OffsetDateTime::now_utc();
                let now_ms = (now.unix_timestamp_nanos() / 1_000_000) as i64;
                let window_ms = self.config.window.as_millis() as i64;
                let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());

                let (allowed, count, oldest_ms): (i64, i64, i64) = script
                    .key(format!("{prefix}:ratelimit:{key}"))
                    .arg(now_ms)
                    .arg(window_ms)
                    .arg(self.config.limit)
                    .arg(member)
                    .invoke_async(&mut conn)
                    .await?;

                let reset_in_ms = (oldest_ms + window_ms - now_ms).max(0);
                let reset_at = now + time::Duration::milliseconds(reset_in_ms);
                let allowed = allowed == 1;

                Ok(RateLimitResult {
                    allowed,
                    limit: self.config.limit,
                    remaining: self.config.limit.saturating_sub(count.max(0) as u32),
                    reset_at,
                    retry_after_seconds: if allowed {
                        0
                    } else {
                        (reset_in_ms as u64).div_ceil(1000).max(1)
                    },
                })
            }
        }
    }

    /// Drop in-memory windows that have been idle for a while. No-op for Redis,
    /// where keys expire on their own.
    pub async fn cleanup(&self) -> usize {
        let Backend::InMemory(windows) = &self.backend else {
            return 0;
        };
        let mut windows = windows.lock().await;
        let now = Instant::now();
        let horizon = self.config.window.max(IDLE_KEY_TTL);
        let before = windows.len();
        windows.retain(|_, hits| {
            hits.back()
                .is_some_and(|last| now.duration_since(*last) < horizon)
        });
        let removed = before - windows.len();
        if removed > 0 {
            tracing::debug!(removed, "Pruned idle rate limit windows");
        }
        removed
    }
}

/// Run [`RateLimiter::cleanup`] every `period` until `shutdown` fires.
pub fn spawn_cleanup(
    limiter: Arc<RateLimiter>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // First tick completes immediately
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    limiter.cleanup().await;
                }
            }
        }
    })
}

fn check_window(hits: &mut VecDeque<Instant>, now: Instant, config: RateLimitConfig) -> RateLimitResult {
    while let Some(oldest) = hits.front() {
        if now.duration_since(*oldest) >= config.window {
            hits.pop_front();
        } else {
            break;
        }
    }

    let allowed = (hits.len() as u32) < config.limit;
    if allowed {
        hits.push_back(now);
    }

    let reset_in = hits
        .front()
        .map(|oldest| config.window.saturating_sub(now.duration_since(*oldest)))
        .unwrap_or(config.window);

    RateLimitResult {
        allowed,
        limit: config.limit,
        remaining: config.limit.saturating_sub(hits.len() as u32),
        reset_at: OffsetDateTime::now_utc() + reset_in,
        retry_after_seconds: if allowed {
            0
        } else {
            reset_in.as_millis().div_ceil(1000).max(1) as u64
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(limit: u32) -> RateLimitConfig {
        RateLimitConfig {
            limit,
            window: Duration::from_secs(10),
        }
    }

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let mut hits = VecDeque::new();
        let now = Instant::now();
        for i in 0..20 {
            let result = check_window(&mut hits, now, config(20));
            assert!(result.allowed, "request {i} should pass");
            assert_eq!(result.remaining, 19 - i);
        }
        let rejected = check_window(&mut hits, now, config(20));
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert!(rejected.retry_after_seconds >= 1);
    }

    #[test]
    fn window_slides() {
        let mut hits = VecDeque::new();
        let start = Instant::now();
        check_window(&mut hits, start, config(2));
        check_window(&mut hits, start + Duration::from_secs(5), config(2));
        assert!(!check_window(&mut hits, start + Duration::from_secs(9), config(2)).allowed);

        // The first request has left the window, the second has not.
        let result = check_window(&mut hits, start + Duration::from_secs(10), config(2));
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[test]
    fn rejected_requests_do_not_extend_the_window() {
        let mut hits = VecDeque::new();
        let start = Instant::now();
        check_window(&mut hits, start, config(1));
        for s in 1..10 {
            check_window(&mut hits, start + Duration::from_secs(s), config(1));
        }
        assert!(check_window(&mut hits, start + Duration::from_secs(10), config(1)).allowed);
    }

    #[tokio::test]
    async fn keys_are_limited_independently() {
        let limiter = RateLimiter::in_memory(config(1));
        assert!(limiter.check("10.0.0.1").await.unwrap().allowed);
        assert!(!limiter.check("10.0.0.1").await.unwrap().allowed);
        assert!(limiter.check("10.0.0.2").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn cleanup_keeps_recent_windows() {
        let limiter = RateLimiter::new_in_memory();
        limiter.check("10.0.0.1").await.unwrap();
        assert_eq!(limiter.cleanup().await, 0);
        assert_eq!(limiter.tracked_keys().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_cleanup_drops_idle_windows() {
        let limiter = Arc::new(RateLimiter::new_in_memory());
        limiter.check("10.0.0.1").await.unwrap();
        limiter.check("10.0.0.2").await.unwrap();

        let shutdown = CancellationToken::new();
        let task = spawn_cleanup(limiter.clone(), Duration::from_secs(60), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(limiter.tracked_keys().await, 2);

        limiter.check("10.0.0.2").await.unwrap();
        tokio::time::sleep(IDLE_KEY_TTL - Duration::from_secs(30)).await;
        assert_eq!(limiter.tracked_keys().await, 1);

        shutdown.cancel();
        task.await.unwrap();
    }
}
