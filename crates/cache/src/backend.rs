//! Cache backend abstraction.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;

/// The primitives the core needs from the shared fast cache.
///
/// String keys carry counters and serialized records; sorted sets carry the
/// queue scheduling state (ready, delayed and active jobs, scored by
/// priority or deadline). Implementations must make `incr` and the sorted
/// set operations individually atomic; multi-step claims are built on top
/// of [`zrem`](CacheBackend::zrem) returning whether the caller won the
/// removal.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Set a string value, optionally with a time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Delete a key.
    async fn del(&self, key: &str) -> Result<(), CacheError>;

    /// Atomically increment a counter, creating it at 0 first if missing.
    async fn incr(&self, key: &str) -> Result<i64, CacheError>;

    /// Atomically decrement a counter.
    async fn decr(&self, key: &str) -> Result<i64, CacheError>;

    /// Remaining time-to-live in milliseconds. Returns -1 when the key has
    /// no expiry and -2 when the key does not exist.
    async fn pttl(&self, key: &str) -> Result<i64, CacheError>;

    /// Set a key's time-to-live.
    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Add a member to a sorted set, replacing its score if present.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), CacheError>;

    /// Remove a member from a sorted set. Returns `true` when the member was
    /// present, which makes a successful removal an atomic claim.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    /// Number of members in a sorted set.
    async fn zcard(&self, key: &str) -> Result<u64, CacheError>;

    /// Score of a member, if present.
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, CacheError>;

    /// Members with score at most `max`, lowest first, capped at `limit`.
    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, CacheError>;
}
