//! Breaker-guarded cache client.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::CacheBackend;
use crate::breaker::{BreakerStatus, CircuitBreaker};
use crate::error::CacheError;

/// A [`CacheBackend`] wrapped by a [`CircuitBreaker`].
///
/// Every call first asks the breaker for admission (failing fast with
/// [`CacheError::BreakerOpen`] otherwise) and records the outcome. Consumers
/// decide their own degradation policy on top: the queue manager propagates
/// the error to its caller, the rate limiter fails open.
#[derive(Clone)]
pub struct GuardedCache {
    backend: Arc<dyn CacheBackend>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedCache {
    /// Wrap a backend with a breaker.
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { backend, breaker }
    }

    /// The breaker guarding this cache.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Breaker diagnostic snapshot.
    #[must_use]
    pub fn breaker_status(&self) -> BreakerStatus {
        self.breaker.status()
    }

    async fn guard<T, F>(&self, call: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        if !self.breaker.can_execute() {
            return Err(CacheError::BreakerOpen);
        }

        match call.await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(err) => {
                self.breaker.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Get a string value.
    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.guard(self.backend.get(key)).await
    }

    /// Set a string value, optionally with a time-to-live.
    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.guard(self.backend.set(key, value, ttl)).await
    }

    /// Delete a key.
    pub async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.guard(self.backend.del(key)).await
    }

    /// Atomically increment a counter.
    pub async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.guard(self.backend.incr(key)).await
    }

    /// Atomically decrement a counter.
    pub async fn decr(&self, key: &str) -> Result<i64, CacheError> {
        self.guard(self.backend.decr(key)).await
    }

    /// Remaining time-to-live in milliseconds (-1 none, -2 missing).
    pub async fn pttl(&self, key: &str) -> Result<i64, CacheError> {
        self.guard(self.backend.pttl(key)).await
    }

    /// Set a key's time-to-live.
    pub async fn pexpire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.guard(self.backend.pexpire(key, ttl)).await
    }

    /// Add a member to a sorted set.
    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), CacheError> {
        self.guard(self.backend.zadd(key, score, member)).await
    }

    /// Remove a member from a sorted set; `true` when the caller won the claim.
    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.guard(self.backend.zrem(key, member)).await
    }

    /// Number of members in a sorted set.
    pub async fn zcard(&self, key: &str) -> Result<u64, CacheError> {
        self.guard(self.backend.zcard(key)).await
    }

    /// Score of a member, if present.
    pub async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, CacheError> {
        self.guard(self.backend.zscore(key, member)).await
    }

    /// Members with score at most `max`, lowest first.
    pub async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, CacheError> {
        self.guard(self.backend.zrange_by_score(key, max, limit))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::memory::MemoryBackend;
    use courier_common::config::BreakerSettings;

    fn guarded() -> GuardedCache {
        GuardedCache::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(CircuitBreaker::new("cache", BreakerSettings::default())),
        )
    }

    #[tokio::test]
    async fn test_passes_calls_through_while_closed() {
        let cache = guarded();

        cache.set("k", "v", None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(cache.breaker_status().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_fails_fast_when_breaker_open() {
        let cache = guarded();

        cache.breaker().record_failure(&CacheError::CapacityExceeded(
            "max requests limit exceeded".into(),
        ));

        match cache.get("k").await {
            Err(CacheError::BreakerOpen) => {}
            other => panic!("Expected BreakerOpen, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_successes_keep_failure_count_at_zero() {
        let cache = guarded();

        for _ in 0..10 {
            cache.incr("counter").await.unwrap();
        }

        let status = cache.breaker_status();
        assert_eq!(status.failure_count, 0);
        assert!(status.can_execute);
    }
}
