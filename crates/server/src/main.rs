//! Courier-rs server entry point.
//!
//! Wires the core together: shared cache behind its circuit breaker, the
//! priority queues and their worker pools, the channel gateway and live
//! registry, the health supervisor loop and the operational HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_api::{DistributedRateLimiter, OpsState, RateLimiterState, router};
use courier_cache::{CircuitBreaker, GuardedCache, RedisBackend};
use courier_channel::{
    ChannelGateway, ConnectionRegistry, HealthSupervisor, MemoryInstanceStore, run_supervisor,
};
use courier_common::{AppResult, Config};
use fred::interfaces::ClientLike;
use courier_queue::{
    AutomationHandler, CampaignHandler, JobOutcome, MessageHandler, MessageJob, MessageResponder,
    OutcomeKind, QueueManager, QueueName, RecurringScheduler, WorkerPool,
};
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default responder: the conversation engine is a separate deployable that
/// registers its own [`MessageResponder`]; without one, inbound messages
/// are processed (and acknowledged to the queue) but no reply is sent.
struct NoReplyResponder;

#[async_trait]
impl MessageResponder for NoReplyResponder {
    async fn respond(&self, message: &MessageJob) -> AppResult<Option<String>> {
        tracing::debug!(
            tenant_id = %message.tenant_id,
            message_id = %message.message_id,
            "No conversation engine attached, skipping reply"
        );
        Ok(None)
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

/// Log job outcome events the way the monitoring board expects them.
fn spawn_outcome_logger(mut outcomes: broadcast::Receiver<JobOutcome>) {
    tokio::spawn(async move {
        loop {
            match outcomes.recv().await {
                Ok(outcome) => match &outcome.result {
                    OutcomeKind::Completed => {
                        info!(job_id = %outcome.job_id, queue = %outcome.queue, "Job completed");
                    }
                    OutcomeKind::Rescheduled { delay_ms } => {
                        tracing::warn!(
                            job_id = %outcome.job_id,
                            queue = %outcome.queue,
                            delay_ms,
                            "Job rescheduled"
                        );
                    }
                    OutcomeKind::DeadLettered { error } => {
                        tracing::error!(
                            job_id = %outcome.job_id,
                            queue = %outcome.queue,
                            tenant_id = %outcome.tenant_id,
                            error,
                            "Job failed"
                        );
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Outcome logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .init();

    info!("Starting courier-rs server...");

    // Load configuration
    let config = Config::load()?;

    // Connect to Redis (the shared fast cache)
    info!("Connecting to Redis...");
    let fred_config = fred::types::config::Config::from_url(&config.redis.url)
        .expect("Failed to parse Redis URL");
    let fred_client = fred::clients::Client::new(fred_config, None, None, None);
    fred_client.connect();
    fred_client
        .wait_for_connect()
        .await
        .expect("Failed to connect to Redis");
    let fred_client = Arc::new(fred_client);
    info!("Connected to Redis");

    // Shared cache behind its circuit breaker
    let cache_breaker = Arc::new(CircuitBreaker::new("cache", config.breaker.clone()));
    let cache = GuardedCache::new(
        Arc::new(RedisBackend::new(fred_client)),
        cache_breaker.clone(),
    );

    // Channel gateway behind its own breaker, plus the live registry
    let gateway_breaker = Arc::new(CircuitBreaker::new("gateway", config.breaker.clone()));
    let gateway: Arc<dyn ChannelGateway> = Arc::new(
        courier_channel::HttpGateway::new(&config.gateway, gateway_breaker)
            .expect("Failed to create channel gateway"),
    );
    let registry = Arc::new(ConnectionRegistry::new(
        gateway.clone(),
        config.gateway.reconnect.clone(),
    ));

    // Persisted instance records. The hosted relational store plugs in
    // behind `InstanceStore`; embedded mode keeps records in memory.
    let instance_store = Arc::new(MemoryInstanceStore::new());

    // Health supervisor: singleton periodic reconciliation
    let supervisor = Arc::new(HealthSupervisor::new(
        instance_store.clone(),
        registry.clone(),
        config.health.clone(),
    ));
    run_supervisor(supervisor.clone(), config.health.clone()).await;
    info!(
        interval_secs = config.health.interval_secs,
        "Connection health supervisor started"
    );

    // Queue manager and per-queue worker pools
    let manager = Arc::new(QueueManager::new(cache.clone(), config.queues.clone()));

    let message_pool = WorkerPool::start(
        QueueName::Messages,
        manager.clone(),
        Arc::new(MessageHandler::new(
            registry.clone(),
            gateway.clone(),
            Arc::new(NoReplyResponder),
        )),
        config.queues.messages.concurrency,
    );
    let automation_pool = WorkerPool::start(
        QueueName::Automations,
        manager.clone(),
        Arc::new(AutomationHandler::new(
            instance_store.clone(),
            registry.clone(),
            gateway.clone(),
        )),
        config.queues.automations.concurrency,
    );
    let campaign_pool = WorkerPool::start(
        QueueName::Campaigns,
        manager.clone(),
        Arc::new(CampaignHandler::new(
            instance_store.clone(),
            registry.clone(),
            gateway.clone(),
            Duration::from_millis(config.queues.campaign_pace_ms),
        )),
        config.queues.campaigns.concurrency,
    );

    spawn_outcome_logger(message_pool.subscribe());
    spawn_outcome_logger(automation_pool.subscribe());
    spawn_outcome_logger(campaign_pool.subscribe());

    // Daily retention sweep over terminal jobs (dead-letter entries kept)
    {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(86_400));
            interval.tick().await;
            loop {
                interval.tick().await;
                match manager.clean(Duration::from_secs(7 * 24 * 3600)).await {
                    Ok(removed) if removed > 0 => info!(removed, "Old jobs cleaned"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Job cleanup failed"),
                }
            }
        });
    }

    // Recurring scheduler for periodic producers
    let scheduler = Arc::new(RecurringScheduler::new(manager.clone()));

    // Distributed rate limiter over the same guarded cache
    let rate_limiter = RateLimiterState::new(Arc::new(DistributedRateLimiter::new(
        cache,
        config.rate_limit.clone(),
    )));
    info!("Initialized distributed API rate limiter");

    // Operational HTTP surface
    let state = OpsState {
        manager: manager.clone(),
        scheduler: scheduler.clone(),
        supervisor,
        cache_breaker,
    };
    let app = router(state, rate_limiter)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server with graceful shutdown
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain: stop intake first, then let leased jobs finish
    manager.close();
    scheduler.close();
    message_pool.close().await;
    automation_pool.close().await;
    campaign_pool.close().await;

    info!("Server shutdown complete");
    Ok(())
}
