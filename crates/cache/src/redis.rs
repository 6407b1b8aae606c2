//! Redis cache backend.
//!
//! A thin adapter from [`CacheBackend`] onto a single shared fred client.
//! Hosted Redis tiers report quota violations with a "max requests limit
//! exceeded" error; those are surfaced as [`CacheError::CapacityExceeded`]
//! so the circuit breaker opens immediately instead of hammering the server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fred::clients::Client as RedisClient;
use fred::interfaces::{KeysInterface, SortedSetsInterface};
use fred::types::Expiration;

use crate::backend::CacheBackend;
use crate::error::CacheError;

/// Redis-backed [`CacheBackend`] over a shared fred client.
#[derive(Clone)]
pub struct RedisBackend {
    client: Arc<RedisClient>,
}

impl RedisBackend {
    /// Create a backend over an already-connected client.
    #[must_use]
    pub const fn new(client: Arc<RedisClient>) -> Self {
        Self { client }
    }

    fn map_err(err: &fred::error::Error) -> CacheError {
        let message = err.to_string();
        if message.contains("max requests limit exceeded") {
            CacheError::CapacityExceeded(message)
        } else {
            CacheError::Backend(message)
        }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.client
            .get::<Option<String>, _>(key)
            .await
            .map_err(|e| Self::map_err(&e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expiration = ttl.map(|t| Expiration::PX(t.as_millis() as i64));
        self.client
            .set::<(), _, _>(key, value, expiration, None, false)
            .await
            .map_err(|e| Self::map_err(&e))
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.client
            .del::<i64, _>(key)
            .await
            .map(|_| ())
            .map_err(|e| Self::map_err(&e))
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.client
            .incr::<i64, _>(key)
            .await
            .map_err(|e| Self::map_err(&e))
    }

    async fn decr(&self, key: &str) -> Result<i64, CacheError> {
        self.client
            .decr::<i64, _>(key)
            .await
            .map_err(|e| Self::map_err(&e))
    }

    async fn pttl(&self, key: &str) -> Result<i64, CacheError> {
        self.client
            .pttl::<i64, _>(key)
            .await
            .map_err(|e| Self::map_err(&e))
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.client
            .pexpire::<i64, _>(key, ttl.as_millis() as i64, None)
            .await
            .map(|_| ())
            .map_err(|e| Self::map_err(&e))
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), CacheError> {
        self.client
            .zadd::<(), _, _>(key, None, None, false, false, (score, member))
            .await
            .map_err(|e| Self::map_err(&e))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.client
            .zrem::<i64, _, _>(key, member)
            .await
            .map(|removed| removed > 0)
            .map_err(|e| Self::map_err(&e))
    }

    async fn zcard(&self, key: &str) -> Result<u64, CacheError> {
        self.client
            .zcard::<u64, _>(key)
            .await
            .map_err(|e| Self::map_err(&e))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, CacheError> {
        self.client
            .zscore::<Option<f64>, _, _>(key, member)
            .await
            .map_err(|e| Self::map_err(&e))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, CacheError> {
        self.client
            .zrangebyscore::<Vec<(String, f64)>, _, _, _>(
                key,
                f64::NEG_INFINITY,
                max,
                true,
                Some((0, limit as i64)),
            )
            .await
            .map_err(|e| Self::map_err(&e))
    }
}
