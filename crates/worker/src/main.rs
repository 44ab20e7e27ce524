// Worker clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Threadbase Background Worker
//!
//! Consumes both job queues and runs scheduled maintenance:
//! - Knowledge archival jobs (fetch thread, AI enrichment, store, reply)
//! - Stripe webhook jobs (subscription reconciliation)
//! - Worker heartbeat (every 5 minutes)
//! - Queue depth and failed-job report (every minute)
//! - Subscription cache pruning (every 10 minutes)

mod config;

use std::sync::Arc;

use threadbase_archival::{
    AiConfig, ArchivalOptions, ArchivalWorker, DiscordAdapter, ErrorReporter, LogErrorReporter,
    LogNotifier, OpenAiClient, PgKnowledgeStore, Platform, PlatformRegistry, ResendNotifier,
    SlackAdapter, UsageNotifier, WebhookErrorReporter, ARCHIVAL_QUEUE,
};
use threadbase_billing::{
    BillingWorker, CachedSubscriptionFetcher, PgBillingStore, StripeClient,
    StripeSubscriptionFetcher, BILLING_QUEUE,
};
use threadbase_shared::{
    create_pool, run_migrations, JobQueue, QueueConsumer, RedisQueue, RetryPolicy,
};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,threadbase=debug"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Log the depth of each queue, warning about parked jobs.
async fn report_queue_stats(queues: &[Arc<dyn JobQueue>]) {
    for queue in queues {
        match queue.counts().await {
            Ok(counts) if counts.failed > 0 => warn!(
                queue = %queue.name(),
                waiting = counts.waiting,
                delayed = counts.delayed,
                active = counts.active,
                failed = counts.failed,
                "Queue has failed jobs awaiting inspection"
            ),
            Ok(counts) => info!(
                queue = %queue.name(),
                waiting = counts.waiting,
                delayed = counts.delayed,
                active = counts.active,
                "Queue stats"
            ),
            Err(e) => error!(queue = %queue.name(), error = %e, "Failed to read queue stats"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    init_tracing(config.json_logs);

    info!("Starting Threadbase Worker v{}", env!("CARGO_PKG_VERSION"));
    info!(config = ?config, "Configuration loaded");

    // Database
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    info!("Database ready");

    // Queues
    let redis = RedisQueue::connect(&config.redis_url).await?;
    let archival_queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(
        redis.clone(),
        &config.queue_prefix,
        ARCHIVAL_QUEUE,
        RetryPolicy::archival(),
    ));
    let billing_queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(
        redis,
        &config.queue_prefix,
        BILLING_QUEUE,
        RetryPolicy::billing(),
    ));
    info!("Redis queues ready");

    let shutdown = CancellationToken::new();
    let mut consumers: Vec<JoinHandle<()>> = Vec::new();

    // Archival pipeline
    let platforms = PlatformRegistry::new()
        .register(Platform::Slack, Arc::new(SlackAdapter::new()))
        .register(
            Platform::Discord,
            Arc::new(DiscordAdapter::new(config.discord_bot_token.clone())),
        );

    let ai_config = AiConfig::from_env();
    if ai_config.api_key.is_none() {
        warn!("OPENAI_API_KEY not set - archival jobs will fail at the embedding step");
    }

    let errors: Arc<dyn ErrorReporter> = match &config.error_webhook_url {
        Some(url) => Arc::new(WebhookErrorReporter::new(url.clone())),
        None => Arc::new(LogErrorReporter),
    };
    let notifier: Arc<dyn UsageNotifier> = match &config.resend_api_key {
        Some(key) => Arc::new(ResendNotifier::new(key.clone(), config.email_from.clone())),
        None => {
            warn!("RESEND_API_KEY not set - usage notifications will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let archival_worker = ArchivalWorker::new(
        Arc::new(PgKnowledgeStore::new(pool.clone())),
        platforms,
        Arc::new(OpenAiClient::new(ai_config)),
        errors,
        notifier,
    )
    .with_options(ArchivalOptions {
        app_url: config.app_url.clone(),
        ..ArchivalOptions::default()
    });

    let archival_consumer = QueueConsumer::new(archival_queue.clone(), Arc::new(archival_worker))
        .with_concurrency(config.archival_concurrency);
    let token = shutdown.clone();
    consumers.push(tokio::spawn(async move {
        archival_consumer.run(token).await;
    }));
    info!(
        concurrency = config.archival_concurrency,
        "Archival consumer started"
    );

    // Billing pipeline
    let subscription_cache = match StripeClient::from_env() {
        Ok(stripe) => {
            let prices = stripe.config().prices.clone();
            let cache = Arc::new(CachedSubscriptionFetcher::new(Arc::new(
                StripeSubscriptionFetcher::new(stripe),
            )));
            let billing_worker = BillingWorker::new(
                Arc::new(PgBillingStore::new(pool.clone())),
                cache.clone(),
                prices,
            );

            let billing_consumer =
                QueueConsumer::new(billing_queue.clone(), Arc::new(billing_worker))
                    .with_concurrency(config.billing_concurrency);
            let token = shutdown.clone();
            consumers.push(tokio::spawn(async move {
                billing_consumer.run(token).await;
            }));
            info!(
                concurrency = config.billing_concurrency,
                "Billing consumer started"
            );
            Some(cache)
        }
        Err(e) => {
            // Jobs stay queued until Stripe is configured
            warn!(error = %e, "Stripe not configured - billing consumer not started");
            None
        }
    };

    // Create scheduler
    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Job 2: Queue depth report (every minute)
    let stats_queues = vec![archival_queue.clone(), billing_queue.clone()];
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let queues = stats_queues.clone();
            Box::pin(async move {
                report_queue_stats(&queues).await;
            })
        })?)
        .await?;
    info!("Scheduled: Queue stats (every minute)");

    // Job 3: Subscription cache pruning (every 10 minutes)
    if let Some(cache) = subscription_cache {
        scheduler
            .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
                let cache = cache.clone();
                Box::pin(async move {
                    let removed = cache.prune_expired().await;
                    if removed > 0 {
                        info!(removed, "Pruned expired subscription cache entries");
                    }
                })
            })?)
            .await?;
        info!("Scheduled: Subscription cache pruning (every 10 minutes)");
    }

    scheduler.start().await?;
    info!("Worker started, waiting for jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, finishing in-flight jobs");

    shutdown.cancel();
    for consumer in consumers {
        if let Err(e) = consumer.await {
            error!(error = %e, "Queue consumer task panicked");
        }
    }

    if let Err(e) = scheduler.shutdown().await {
        warn!(error = %e, "Scheduler did not shut down cleanly");
    }
    archival_queue.close().await;
    billing_queue.close().await;
    pool.close().await;

    info!("Worker stopped");
    Ok(())
}
