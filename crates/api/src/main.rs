// API server clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Threadbase API Server
//!
//! Webhook ingress: verifies chat-platform and Stripe requests and hands
//! them to the worker through Redis-backed queues.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use threadbase_api::config::{LogFormat, RateLimitStore};
use threadbase_api::{create_router, AppState, Config};
use threadbase_archival::ARCHIVAL_QUEUE;
use threadbase_billing::BILLING_QUEUE;
use threadbase_shared::{
    spawn_cleanup, JobQueue, RateLimitConfig, RateLimiter, RedisQueue, RetryPolicy,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,threadbase_api=debug".into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    tracing::info!("Starting Threadbase API Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(config = ?config, "Configuration loaded");

    // Queues and the webhook rate limiter share one Redis connection
    tracing::info!("Connecting to Redis...");
    let redis = RedisQueue::connect(&config.redis_url).await?;
    tracing::info!("Redis connection established");

    let archival_queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(
        redis.clone(),
        &config.queue_prefix,
        ARCHIVAL_QUEUE,
        RetryPolicy::archival(),
    ));
    let billing_queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(
        redis.clone(),
        &config.queue_prefix,
        BILLING_QUEUE,
        RetryPolicy::billing(),
    ));
    let rate_limiter = Arc::new(match config.rate_limit_store {
        RateLimitStore::Redis => RateLimiter::redis(
            redis,
            config.queue_prefix.clone(),
            RateLimitConfig::webhook(),
        ),
        RateLimitStore::Memory => RateLimiter::in_memory(RateLimitConfig::webhook()),
    });

    // Background task: prune idle in-process rate limit windows (every minute)
    let background = CancellationToken::new();
    let cleanup_task = rate_limiter.is_in_memory().then(|| {
        tracing::info!("Using in-process rate limiter, pruning idle windows every minute");
        spawn_cleanup(
            rate_limiter.clone(),
            Duration::from_secs(60),
            background.clone(),
        )
    });

    let state = AppState::from_config(
        &config,
        archival_queue.clone(),
        billing_queue.clone(),
        rate_limiter,
    )?;

    let app = create_router(state).layer(TraceLayer::new_for_http());

    // Parse bind address
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    background.cancel();
    if let Some(task) = cleanup_task {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Rate limit cleanup task panicked");
        }
    }
    archival_queue.close().await;
    billing_queue.close().await;
    tracing::info!("API server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining connections");
}
