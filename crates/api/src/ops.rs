//! Operational endpoints.
//!
//! The surface business-logic collaborators and the admin dashboard consume:
//! job submission, recurring schedules, queue counts, breaker status and
//! manual health checks. Mutating routes sit under the critical rate limit
//! tier, read routes under the read tier.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router, middleware,
    extract::{Path, State},
    routing::{get, post},
};
use courier_cache::CircuitBreaker;
use courier_channel::HealthSupervisor;
use courier_common::{AppError, AppResult};
use courier_queue::{EnqueueOpts, JobPayload, QueueManager, QueueName, RecurringScheduler};
use serde::{Deserialize, Serialize};

use crate::rate_limit::{
    RateLimiterState, rate_limit_critical_middleware, rate_limit_read_middleware,
};
use crate::response::ApiResponse;

/// Shared state for the operational routes.
#[derive(Clone)]
pub struct OpsState {
    /// Queue manager.
    pub manager: Arc<QueueManager>,
    /// Recurring job scheduler.
    pub scheduler: Arc<RecurringScheduler>,
    /// Connection health supervisor.
    pub supervisor: Arc<HealthSupervisor>,
    /// The breaker guarding the shared cache.
    pub cache_breaker: Arc<CircuitBreaker>,
}

/// Build the operational router with rate limit tiers applied.
pub fn router(state: OpsState, limiter: RateLimiterState) -> Router {
    let read_routes = Router::new()
        .route("/ops/breaker", get(breaker_status))
        .route("/ops/channels/{tenant_id}/{channel_id}", get(channel_status))
        .route("/ops/queues/{name}", get(queue_counts))
        .route_layer(middleware::from_fn_with_state(
            limiter.clone(),
            rate_limit_read_middleware,
        ));

    let critical_routes = Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/recurring", post(schedule_recurring))
        .route("/ops/health-check", post(manual_health_check))
        .route("/ops/breaker/reset", post(reset_breaker))
        .route("/ops/queues/{name}/retry-failed", post(retry_failed))
        .route("/ops/queues/clean", post(clean_queues))
        .route_layer(middleware::from_fn_with_state(
            limiter,
            rate_limit_critical_middleware,
        ));

    Router::new()
        .merge(read_routes)
        .merge(critical_routes)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobRequest {
    queue: String,
    payload: JobPayload,
    priority: Option<u8>,
    delay_ms: Option<u64>,
    job_id: Option<String>,
}

async fn submit_job(
    State(state): State<OpsState>,
    Json(request): Json<SubmitJobRequest>,
) -> AppResult<impl axum::response::IntoResponse> {
    let queue = QueueName::from_str(&request.queue)?;
    let job_ref = state
        .manager
        .enqueue(
            queue,
            request.payload,
            EnqueueOpts {
                priority: request.priority,
                delay: request.delay_ms.map(Duration::from_millis),
                job_id: request.job_id,
            },
        )
        .await?;

    Ok(ApiResponse::ok(job_ref))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRecurringRequest {
    name: Option<String>,
    queue: String,
    payload: JobPayload,
    cron_pattern: String,
    timezone: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRecurringResponse {
    name: String,
    queue: QueueName,
    cron_pattern: String,
    timezone: String,
}

async fn schedule_recurring(
    State(state): State<OpsState>,
    Json(request): Json<ScheduleRecurringRequest>,
) -> AppResult<impl axum::response::IntoResponse> {
    let queue = QueueName::from_str(&request.queue)?;
    let timezone = match &request.timezone {
        Some(tz) => chrono_tz::Tz::from_str(tz)
            .map_err(|_| AppError::BadRequest(format!("unknown timezone: {tz}")))?,
        None => chrono_tz::UTC,
    };
    let name = request
        .name
        .unwrap_or_else(|| format!("{queue}-{}", request.payload.tenant_id()));

    state.scheduler.schedule_recurring(
        &name,
        queue,
        request.payload,
        &request.cron_pattern,
        timezone,
    )?;

    Ok(ApiResponse::ok(ScheduleRecurringResponse {
        name,
        queue,
        cron_pattern: request.cron_pattern,
        timezone: timezone.to_string(),
    }))
}

async fn breaker_status(State(state): State<OpsState>) -> impl axum::response::IntoResponse {
    ApiResponse::ok(state.cache_breaker.status())
}

async fn reset_breaker(State(state): State<OpsState>) -> impl axum::response::IntoResponse {
    state.cache_breaker.reset();
    ApiResponse::ok(state.cache_breaker.status())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthCheckRequest {
    tenant_id: Option<String>,
}

async fn manual_health_check(
    State(state): State<OpsState>,
    Json(request): Json<HealthCheckRequest>,
) -> AppResult<impl axum::response::IntoResponse> {
    let report = state
        .supervisor
        .trigger_manual_check(request.tenant_id.as_deref())
        .await?;
    Ok(ApiResponse::ok(report))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelStatusResponse {
    tenant_id: String,
    channel_id: String,
    connected: bool,
}

async fn channel_status(
    State(state): State<OpsState>,
    Path((tenant_id, channel_id)): Path<(String, String)>,
) -> impl axum::response::IntoResponse {
    let connected = state.supervisor.is_connected(&channel_id, &tenant_id).await;
    ApiResponse::ok(ChannelStatusResponse {
        tenant_id,
        channel_id,
        connected,
    })
}

async fn queue_counts(
    State(state): State<OpsState>,
    Path(name): Path<String>,
) -> AppResult<impl axum::response::IntoResponse> {
    let queue = QueueName::from_str(&name)?;
    let counts = state.manager.counts(queue).await?;
    Ok(ApiResponse::ok(counts))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetryFailedResponse {
    queue: QueueName,
    retried: u64,
}

async fn retry_failed(
    State(state): State<OpsState>,
    Path(name): Path<String>,
) -> AppResult<impl axum::response::IntoResponse> {
    let queue = QueueName::from_str(&name)?;
    let retried = state.manager.retry_all_failed(queue).await?;
    Ok(ApiResponse::ok(RetryFailedResponse { queue, retried }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanRequest {
    older_than_hours: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CleanResponse {
    removed: u64,
}

async fn clean_queues(
    State(state): State<OpsState>,
    Json(request): Json<CleanRequest>,
) -> AppResult<impl axum::response::IntoResponse> {
    let removed = state
        .manager
        .clean(Duration::from_secs(request.older_than_hours * 3600))
        .await?;
    Ok(ApiResponse::ok(CleanResponse { removed }))
}
