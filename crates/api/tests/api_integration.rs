//! API integration tests.
//!
//! Drive the operational router with Tower's `oneshot` against in-memory
//! backends: no Redis, no provider, no network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use courier_api::{DistributedRateLimiter, OpsState, RateLimiterState, router};
use courier_cache::{CircuitBreaker, GuardedCache, MemoryBackend};
use courier_channel::{
    ConnectionHealth, GatewayError, HealthSupervisor, LiveRegistry, MemoryInstanceStore,
};
use courier_common::config::{
    BreakerSettings, HealthSettings, QueueSettings, RateLimitSettings, TierSettings,
};
use courier_queue::{QueueManager, RecurringScheduler};
use tower::ServiceExt;

struct StaticRegistry(bool);

#[async_trait]
impl LiveRegistry for StaticRegistry {
    async fn is_live(&self, _tenant: &str, _channel: &str) -> bool {
        self.0
    }

    async fn health(&self, _tenant: &str, _channel: &str) -> ConnectionHealth {
        ConnectionHealth {
            connected: self.0,
            reconnect_attempts: 0,
            last_activity: None,
        }
    }

    async fn force_reconnect(&self, _tenant: &str, _channel: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn cleanup_sessions(&self, _older_than: Duration) -> Result<u64, GatewayError> {
        Ok(0)
    }
}

fn test_app(rate_limits: RateLimitSettings) -> (Router, Arc<QueueManager>) {
    let breaker = Arc::new(CircuitBreaker::new("cache", BreakerSettings::default()));
    let cache = GuardedCache::new(Arc::new(MemoryBackend::new()), breaker.clone());

    let manager = Arc::new(QueueManager::new(cache.clone(), QueueSettings::default()));
    let scheduler = Arc::new(RecurringScheduler::new(manager.clone()));
    let supervisor = Arc::new(HealthSupervisor::new(
        Arc::new(MemoryInstanceStore::new()),
        Arc::new(StaticRegistry(true)),
        HealthSettings::default(),
    ));

    let limiter = RateLimiterState::new(Arc::new(DistributedRateLimiter::new(cache, rate_limits)));

    let state = OpsState {
        manager: manager.clone(),
        scheduler,
        supervisor,
        cache_breaker: breaker,
    };
    (router(state, limiter), manager)
}

fn submit_job_request() -> Request<Body> {
    let body = serde_json::json!({
        "queue": "messages",
        "jobId": "m1",
        "payload": {
            "type": "message",
            "tenantId": "t1",
            "channelId": "c1",
            "from": "5511999@provider",
            "content": "hello",
            "messageId": "prov-1"
        }
    });

    Request::builder()
        .method("POST")
        .uri("/jobs")
        .header("content-type", "application/json")
        .header("x-forwarded-for", "1.2.3.4")
        .header("x-tenant-id", "t1")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_submit_job_records_work() {
    let (app, manager) = test_app(RateLimitSettings::default());

    let response = app.oneshot(submit_job_request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["id"], "m1");
    assert_eq!(json["data"]["queue"], "messages");

    let counts = manager.counts("messages".parse().unwrap()).await.unwrap();
    assert_eq!(counts.waiting, 1);
}

#[tokio::test]
async fn test_submission_is_idempotent_per_job_id() {
    let (app, manager) = test_app(RateLimitSettings::default());

    app.clone().oneshot(submit_job_request()).await.unwrap();
    app.oneshot(submit_job_request()).await.unwrap();

    let counts = manager.counts("messages".parse().unwrap()).await.unwrap();
    assert_eq!(counts.waiting, 1);
}

#[tokio::test]
async fn test_admitted_responses_carry_quota_headers() {
    let (app, _manager) = test_app(RateLimitSettings::default());

    let response = app.oneshot(submit_job_request()).await.unwrap();

    let headers = response.headers();
    assert_eq!(headers.get("X-RateLimit-Limit").unwrap(), "10");
    assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "9");
    assert!(headers.contains_key("X-RateLimit-Reset"));
}

#[tokio::test]
async fn test_rejection_contract_is_429_with_retry_after() {
    let settings = RateLimitSettings {
        critical: TierSettings::new(2, 60),
        ..RateLimitSettings::default()
    };
    let (app, _manager) = test_app(settings);

    for _ in 0..2 {
        let response = app.clone().oneshot(submit_job_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.oneshot(submit_job_request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let retry_after: u64 = response
        .headers()
        .get("Retry-After")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after <= 60);

    let json = body_json(response).await;
    assert_eq!(json["error"], "Too many requests");
    assert!(json["message"].is_string());
    assert!(json["retryAfter"].as_u64().unwrap() <= 60);
}

#[tokio::test]
async fn test_distinct_tenants_do_not_share_quota() {
    let settings = RateLimitSettings {
        critical: TierSettings::new(1, 60),
        ..RateLimitSettings::default()
    };
    let (app, _manager) = test_app(settings);

    let response = app.clone().oneshot(submit_job_request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Same address, different tenant header: separate counter.
    let mut request = submit_job_request();
    request
        .headers_mut()
        .insert("x-tenant-id", "t2".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_breaker_status_endpoint() {
    let (app, _manager) = test_app(RateLimitSettings::default());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/ops/breaker")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["state"], "CLOSED");
    assert_eq!(json["data"]["failureCount"], 0);
    assert_eq!(json["data"]["canExecute"], true);
}

#[tokio::test]
async fn test_channel_connectivity_query() {
    let (app, _manager) = test_app(RateLimitSettings::default());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/ops/channels/t1/c1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["connected"], true);
    assert_eq!(json["data"]["tenantId"], "t1");
}

#[tokio::test]
async fn test_manual_health_check_returns_report() {
    let (app, _manager) = test_app(RateLimitSettings::default());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/ops/health-check")
                .header("content-type", "application/json")
                .body(Body::from("{\"tenantId\":\"t1\"}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["totalInstances"], 0);
    assert!(json["data"]["alerts"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_queue_is_not_found() {
    let (app, _manager) = test_app(RateLimitSettings::default());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/ops/queues/bogus")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_queue_counts_endpoint() {
    let (app, _manager) = test_app(RateLimitSettings::default());

    app.clone().oneshot(submit_job_request()).await.unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/ops/queues/messages")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["data"]["waiting"], 1);
    assert_eq!(json["data"]["active"], 0);
}
