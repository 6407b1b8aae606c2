//! In-memory cache backend.
//!
//! Used by the test suites and by embedded development mode, where running a
//! Redis server is not worth the setup. Semantics mirror the Redis backend:
//! lazy expiry on read, -1/-2 TTL sentinels, sorted sets ordered by
//! (score, member).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::backend::CacheBackend;
use crate::error::CacheError;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Default)]
struct Inner {
    strings: HashMap<String, Entry>,
    zsets: HashMap<String, HashMap<String, f64>>,
}

/// In-memory [`CacheBackend`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut inner = self.inner.write().await;
        match inner.strings.get(key) {
            Some(entry) if entry.is_expired() => {
                inner.strings.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut inner = self.inner.write().await;
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut inner = self.inner.write().await;
        inner.strings.remove(key);
        inner.zsets.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let mut inner = self.inner.write().await;
        let expired = inner.strings.get(key).is_some_and(Entry::is_expired);
        if expired {
            inner.strings.remove(key);
        }

        let (current, expires_at) = match inner.strings.get(key) {
            Some(entry) => {
                let n: i64 = entry
                    .value
                    .parse()
                    .map_err(|_| CacheError::Backend(format!("value at {key} is not an integer")))?;
                (n, entry.expires_at)
            }
            None => (0, None),
        };

        let next = current + 1;
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn decr(&self, key: &str) -> Result<i64, CacheError> {
        let mut inner = self.inner.write().await;
        let (current, expires_at) = match inner.strings.get(key) {
            Some(entry) if !entry.is_expired() => {
                let n: i64 = entry
                    .value
                    .parse()
                    .map_err(|_| CacheError::Backend(format!("value at {key} is not an integer")))?;
                (n, entry.expires_at)
            }
            _ => (0, None),
        };

        let next = current - 1;
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn pttl(&self, key: &str) -> Result<i64, CacheError> {
        let inner = self.inner.read().await;
        match inner.strings.get(key) {
            Some(entry) if entry.is_expired() => Ok(-2),
            Some(entry) => match entry.expires_at {
                Some(at) => Ok(at.saturating_duration_since(Instant::now()).as_millis() as i64),
                None => Ok(-1),
            },
            None => Ok(-2),
        }
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), CacheError> {
        let mut inner = self.inner.write().await;
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .zsets
            .get_mut(key)
            .is_some_and(|set| set.remove(member).is_some()))
    }

    async fn zcard(&self, key: &str) -> Result<u64, CacheError> {
        let inner = self.inner.read().await;
        Ok(inner.zsets.get(key).map_or(0, |set| set.len() as u64))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, CacheError> {
        let inner = self.inner.read().await;
        Ok(inner.zsets.get(key).and_then(|set| set.get(member).copied()))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, CacheError> {
        let inner = self.inner.read().await;
        let Some(set) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };

        let mut members: Vec<(String, f64)> = set
            .iter()
            .filter(|(_, score)| **score <= max)
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        // Ties on score break lexicographically by member, matching Redis.
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members.truncate(limit);
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_del() {
        let backend = MemoryBackend::new();

        backend.set("k", "v", None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some("v".to_string()));

        backend.del("k").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let backend = MemoryBackend::new();

        backend
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(backend.pttl("k").await.unwrap() >= 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(backend.pttl("k").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn test_incr_and_pexpire() {
        let backend = MemoryBackend::new();

        assert_eq!(backend.incr("counter").await.unwrap(), 1);
        assert_eq!(backend.incr("counter").await.unwrap(), 2);
        assert_eq!(backend.pttl("counter").await.unwrap(), -1);

        backend
            .pexpire("counter", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(backend.pttl("counter").await.unwrap() > 0);

        assert_eq!(backend.decr("counter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incr_restarts_after_expiry() {
        let backend = MemoryBackend::new();

        backend.incr("counter").await.unwrap();
        backend
            .pexpire("counter", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Window rolled over: count restarts at 1.
        assert_eq!(backend.incr("counter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zset_ordering_and_claims() {
        let backend = MemoryBackend::new();

        backend.zadd("z", 3.0, "c").await.unwrap();
        backend.zadd("z", 1.0, "a").await.unwrap();
        backend.zadd("z", 2.0, "b").await.unwrap();

        let range = backend.zrange_by_score("z", 2.5, 10).await.unwrap();
        assert_eq!(
            range.iter().map(|(m, _)| m.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        assert!(backend.zrem("z", "a").await.unwrap());
        assert!(!backend.zrem("z", "a").await.unwrap());
        assert_eq!(backend.zcard("z").await.unwrap(), 2);
        assert_eq!(backend.zscore("z", "b").await.unwrap(), Some(2.0));
    }

    #[tokio::test]
    async fn test_zset_equal_scores_order_by_member() {
        let backend = MemoryBackend::new();

        backend.zadd("z", 1.0, "job-2").await.unwrap();
        backend.zadd("z", 1.0, "job-1").await.unwrap();

        let range = backend.zrange_by_score("z", f64::MAX, 10).await.unwrap();
        assert_eq!(range[0].0, "job-1");
        assert_eq!(range[1].0, "job-2");
    }
}
