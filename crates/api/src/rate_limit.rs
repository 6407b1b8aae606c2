//! Distributed API rate limiting.
//!
//! Fixed time windows counted atomically in the shared cache, so limits
//! hold across every server process: `INCR` the key, set the window expiry
//! on first increment, reject once the count passes the tier maximum.
//!
//! Counter calls go through the cache circuit breaker. On breaker-open or
//! cache error the limiter **fails open** - the request is admitted and the
//! condition logged - trading strict enforcement for availability during
//! cache outages.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use courier_cache::{CacheError, GuardedCache};
use courier_common::config::{RateLimitSettings, TierSettings};

/// Rate limit tiers, by endpoint criticality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitTier {
    /// Critical mutating operations. Tight limit.
    Critical,
    /// Standard CRUD operations.
    Standard,
    /// Read-heavy / analytics operations. Loose limit.
    Read,
    /// Realtime channel connection attempts, keyed by address only.
    Realtime,
    /// Authentication attempts, keyed by submitted identity to slow
    /// credential stuffing across source addresses.
    Auth,
    /// Inbound third-party webhooks. High volume, signature-gated.
    Webhook,
    /// Catch-all for uncategorized routes.
    Global,
}

impl RateLimitTier {
    /// Tier name used in counter keys and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Standard => "standard",
            Self::Read => "read",
            Self::Realtime => "realtime",
            Self::Auth => "auth",
            Self::Webhook => "webhook",
            Self::Global => "global",
        }
    }

    /// Rejection message for this tier.
    const fn message(self) -> &'static str {
        match self {
            Self::Critical => "Please wait before making another request",
            Self::Standard => "Rate limit exceeded. Please slow down.",
            Self::Read => "Too many read requests. Please implement caching.",
            Self::Realtime => "Please wait before reconnecting",
            Self::Auth => "Too many authentication attempts. Please try again later.",
            Self::Webhook | Self::Global => "Too many requests",
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy)]
pub enum RateLimitDecision {
    /// Admitted; headers communicate the remaining quota.
    Allowed {
        /// Tier maximum.
        limit: u32,
        /// Requests left in this window.
        remaining: u32,
        /// Seconds until the window resets.
        reset: u64,
    },
    /// Rejected with a retry-after hint.
    Limited {
        /// Tier maximum.
        limit: u32,
        /// Seconds until the window resets.
        retry_after: u64,
    },
    /// The cache was unreachable; the request is admitted unenforced.
    FailOpen,
}

/// Fixed-window limiter over the breaker-guarded cache.
pub struct DistributedRateLimiter {
    cache: GuardedCache,
    settings: RateLimitSettings,
}

impl DistributedRateLimiter {
    /// Create a limiter.
    #[must_use]
    pub const fn new(cache: GuardedCache, settings: RateLimitSettings) -> Self {
        Self { cache, settings }
    }

    fn tier_settings(&self, tier: RateLimitTier) -> TierSettings {
        match tier {
            RateLimitTier::Critical => self.settings.critical,
            RateLimitTier::Standard => self.settings.standard,
            RateLimitTier::Read => self.settings.read,
            RateLimitTier::Realtime => self.settings.realtime,
            RateLimitTier::Auth => self.settings.auth,
            RateLimitTier::Webhook => self.settings.webhook,
            RateLimitTier::Global => self.settings.global,
        }
    }

    /// Check and count one request for `key` in the tier's window.
    pub async fn check(&self, tier: RateLimitTier, key: &str) -> RateLimitDecision {
        let tier_settings = self.tier_settings(tier);
        let counter_key = format!("rl:{}:{key}", tier.as_str());

        match self.count(&counter_key, tier_settings).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(
                    tier = tier.as_str(),
                    key = %counter_key,
                    error = %err,
                    "Rate limiter cache unavailable, failing open"
                );
                RateLimitDecision::FailOpen
            }
        }
    }

    async fn count(
        &self,
        key: &str,
        tier: TierSettings,
    ) -> Result<RateLimitDecision, CacheError> {
        let count = self.cache.incr(key).await?;

        // A counter without a TTL would count forever; assign the window
        // immediately after creation.
        let window_ms = tier.window().as_millis() as i64;
        let ttl = self.cache.pttl(key).await?;
        let remaining_ms = if ttl < 0 {
            self.cache.pexpire(key, tier.window()).await?;
            window_ms
        } else {
            ttl
        };
        let reset = (remaining_ms.max(0) as u64).div_ceil(1000);

        if count > i64::from(tier.max_requests) {
            Ok(RateLimitDecision::Limited {
                limit: tier.max_requests,
                retry_after: reset,
            })
        } else {
            Ok(RateLimitDecision::Allowed {
                limit: tier.max_requests,
                remaining: tier.max_requests.saturating_sub(count as u32),
                reset,
            })
        }
    }

    /// Best-effort undo of a counted request (for example a cancelled
    /// upload). Once the window has rotated, the decrement lands on a fresh
    /// counter and is harmless but meaningless - do not rely on it.
    pub async fn forget(&self, tier: RateLimitTier, key: &str) {
        let counter_key = format!("rl:{}:{key}", tier.as_str());
        if let Err(err) = self.cache.decr(&counter_key).await {
            tracing::debug!(key = %counter_key, error = %err, "Rate limit decrement failed");
        }
    }
}

/// Shared middleware state.
#[derive(Clone)]
pub struct RateLimiterState {
    /// The distributed limiter.
    pub limiter: Arc<DistributedRateLimiter>,
}

impl RateLimiterState {
    /// Wrap a limiter for middleware use.
    #[must_use]
    pub const fn new(limiter: Arc<DistributedRateLimiter>) -> Self {
        Self { limiter }
    }
}

/// Rate limit rejection response: HTTP 429 with a structured body and a
/// `Retry-After` header.
#[derive(Debug)]
pub struct RateLimitError {
    /// Seconds until the window resets.
    pub retry_after: u64,
    message: &'static str,
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": "Too many requests",
            "message": self.message,
            "retryAfter": self.retry_after,
        });

        (
            StatusCode::TOO_MANY_REQUESTS,
            [
                ("Retry-After", self.retry_after.to_string()),
                ("Content-Type", "application/json".to_string()),
            ],
            body.to_string(),
        )
            .into_response()
    }
}

/// Extract the client address from proxy headers.
fn extract_client_ip(req: &Request<Body>) -> Option<IpAddr> {
    if let Some(xff) = req.headers().get("x-forwarded-for") {
        if let Ok(xff_str) = xff.to_str() {
            if let Some(first_ip) = xff_str.split(',').next() {
                if let Ok(ip) = first_ip.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(real_ip) = req.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            if let Ok(ip) = ip_str.parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    None
}

fn header_value<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Counting key for a request in the given tier.
///
/// Most tiers key on address + tenant + route for isolation between
/// tenants behind shared NATs. The auth tier keys on the submitted
/// identity; webhooks key on the channel instance the event is for.
fn key_for(tier: RateLimitTier, req: &Request<Body>) -> String {
    let ip = extract_client_ip(req).map_or_else(|| "unknown".to_string(), |ip| ip.to_string());

    match tier {
        RateLimitTier::Critical | RateLimitTier::Standard | RateLimitTier::Read => {
            let tenant = header_value(req, "x-tenant-id").unwrap_or("anonymous");
            format!("{ip}:{tenant}:{}", req.uri().path())
        }
        RateLimitTier::Realtime | RateLimitTier::Global => ip,
        RateLimitTier::Auth => {
            let identity = header_value(req, "x-auth-identity").unwrap_or(&ip);
            format!("auth:{identity}")
        }
        RateLimitTier::Webhook => {
            let instance = req
                .uri()
                .query()
                .and_then(|q| {
                    q.split('&')
                        .find_map(|pair| pair.strip_prefix("instanceId="))
                })
                .unwrap_or("unknown");
            format!("webhook:{instance}")
        }
    }
}

async fn rate_limit_with_tier(
    state: RateLimiterState,
    req: Request<Body>,
    next: Next,
    tier: RateLimitTier,
) -> Result<Response, RateLimitError> {
    // Unsigned webhook deliveries are rejected upstream by signature
    // verification; counting them would let a forger exhaust the quota of a
    // legitimate instance.
    if tier == RateLimitTier::Webhook && header_value(&req, "x-webhook-signature").is_none() {
        return Ok(next.run(req).await);
    }

    let key = key_for(tier, &req);
    match state.limiter.check(tier, &key).await {
        RateLimitDecision::Allowed {
            limit,
            remaining,
            reset,
        } => {
            let mut response = next.run(req).await;
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
            headers.insert("X-RateLimit-Reset", HeaderValue::from(reset));
            Ok(response)
        }
        RateLimitDecision::Limited { retry_after, .. } => {
            tracing::warn!(
                tier = tier.as_str(),
                key = %key,
                path = %req.uri().path(),
                "Rate limit exceeded"
            );
            Err(RateLimitError {
                retry_after,
                message: tier.message(),
            })
        }
        RateLimitDecision::FailOpen => Ok(next.run(req).await),
    }
}

/// Standard-tier rate limiting middleware.
pub async fn rate_limit_middleware(
    State(state): State<RateLimiterState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, RateLimitError> {
    rate_limit_with_tier(state, req, next, RateLimitTier::Standard).await
}

/// Critical-tier rate limiting middleware for mutating operations.
pub async fn rate_limit_critical_middleware(
    State(state): State<RateLimiterState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, RateLimitError> {
    rate_limit_with_tier(state, req, next, RateLimitTier::Critical).await
}

/// Read-tier rate limiting middleware for dashboards and analytics.
pub async fn rate_limit_read_middleware(
    State(state): State<RateLimiterState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, RateLimitError> {
    rate_limit_with_tier(state, req, next, RateLimitTier::Read).await
}

/// Realtime-tier rate limiting middleware for connection attempts.
pub async fn rate_limit_realtime_middleware(
    State(state): State<RateLimiterState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, RateLimitError> {
    rate_limit_with_tier(state, req, next, RateLimitTier::Realtime).await
}

/// Auth-tier rate limiting middleware, keyed by submitted identity.
pub async fn rate_limit_auth_middleware(
    State(state): State<RateLimiterState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, RateLimitError> {
    rate_limit_with_tier(state, req, next, RateLimitTier::Auth).await
}

/// Webhook-tier rate limiting middleware, keyed by channel instance.
pub async fn rate_limit_webhook_middleware(
    State(state): State<RateLimiterState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, RateLimitError> {
    rate_limit_with_tier(state, req, next, RateLimitTier::Webhook).await
}

/// Global catch-all rate limiting middleware.
pub async fn rate_limit_global_middleware(
    State(state): State<RateLimiterState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, RateLimitError> {
    rate_limit_with_tier(state, req, next, RateLimitTier::Global).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use courier_cache::{CircuitBreaker, MemoryBackend};
    use courier_common::config::BreakerSettings;

    fn limiter(settings: RateLimitSettings) -> DistributedRateLimiter {
        let cache = GuardedCache::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(CircuitBreaker::new("cache", BreakerSettings::default())),
        );
        DistributedRateLimiter::new(cache, settings)
    }

    fn tight_settings() -> RateLimitSettings {
        RateLimitSettings {
            critical: TierSettings::new(10, 60),
            ..RateLimitSettings::default()
        }
    }

    #[tokio::test]
    async fn test_admits_up_to_limit_then_rejects() {
        let limiter = limiter(tight_settings());

        for i in 1..=10 {
            match limiter.check(RateLimitTier::Critical, "1.2.3.4:t1:/jobs").await {
                RateLimitDecision::Allowed { remaining, limit, .. } => {
                    assert_eq!(limit, 10);
                    assert_eq!(remaining, 10 - i);
                }
                other => panic!("request {i} should be allowed, got {other:?}"),
            }
        }

        // Request 11 is rejected with a retry-after within the window.
        match limiter.check(RateLimitTier::Critical, "1.2.3.4:t1:/jobs").await {
            RateLimitDecision::Limited { retry_after, limit } => {
                assert_eq!(limit, 10);
                assert!(retry_after > 0 && retry_after <= 60);
            }
            other => panic!("request 11 should be limited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_window_expiry_resets_counter() {
        let limiter = limiter(RateLimitSettings {
            critical: TierSettings {
                window_secs: 1,
                max_requests: 1,
            },
            ..RateLimitSettings::default()
        });

        // Window of one second for the test; first request fills it.
        assert!(matches!(
            limiter.check(RateLimitTier::Critical, "k").await,
            RateLimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check(RateLimitTier::Critical, "k").await,
            RateLimitDecision::Limited { .. }
        ));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(matches!(
            limiter.check(RateLimitTier::Critical, "k").await,
            RateLimitDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn test_separate_keys_have_separate_quotas() {
        let limiter = limiter(RateLimitSettings {
            critical: TierSettings::new(1, 60),
            ..RateLimitSettings::default()
        });

        assert!(matches!(
            limiter.check(RateLimitTier::Critical, "tenant-a").await,
            RateLimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check(RateLimitTier::Critical, "tenant-b").await,
            RateLimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check(RateLimitTier::Critical, "tenant-a").await,
            RateLimitDecision::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn test_tiers_do_not_share_counters() {
        let limiter = limiter(RateLimitSettings {
            critical: TierSettings::new(1, 60),
            read: TierSettings::new(1, 60),
            ..RateLimitSettings::default()
        });

        assert!(matches!(
            limiter.check(RateLimitTier::Critical, "k").await,
            RateLimitDecision::Allowed { .. }
        ));
        // Same key in a different tier still has quota.
        assert!(matches!(
            limiter.check(RateLimitTier::Read, "k").await,
            RateLimitDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn test_fails_open_when_breaker_is_open() {
        let limiter = limiter(tight_settings());

        limiter
            .cache
            .breaker()
            .record_failure(&CacheError::CapacityExceeded(
                "max requests limit exceeded".into(),
            ));

        assert!(matches!(
            limiter.check(RateLimitTier::Critical, "k").await,
            RateLimitDecision::FailOpen
        ));
    }

    #[tokio::test]
    async fn test_forget_returns_quota() {
        let limiter = limiter(RateLimitSettings {
            critical: TierSettings::new(1, 60),
            ..RateLimitSettings::default()
        });

        assert!(matches!(
            limiter.check(RateLimitTier::Critical, "k").await,
            RateLimitDecision::Allowed { .. }
        ));
        limiter.forget(RateLimitTier::Critical, "k").await;
        assert!(matches!(
            limiter.check(RateLimitTier::Critical, "k").await,
            RateLimitDecision::Allowed { .. }
        ));
    }
}
