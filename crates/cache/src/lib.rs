//! Shared fast-cache client for courier-rs.
//!
//! This crate provides the low-latency key/value layer every other courier
//! component builds on:
//!
//! - **Backends**: Redis (fred) and in-memory implementations of [`CacheBackend`]
//! - **Circuit breaker**: [`CircuitBreaker`] guarding calls into the cache
//! - **Guarded client**: [`GuardedCache`] combining a backend with a breaker
//!
//! Key spaces are disjoint per consumer (`jobs:*` for the queue system,
//! `rl:*` for the rate limiter), so no cross-component locking is needed on
//! top of the cache's own primitive atomicity.

pub mod backend;
pub mod breaker;
pub mod error;
pub mod guarded;
pub mod memory;
pub mod redis;

pub use backend::CacheBackend;
pub use breaker::{BreakerError, BreakerState, BreakerStatus, CircuitBreaker};
pub use error::CacheError;
pub use guarded::GuardedCache;
pub use memory::MemoryBackend;
pub use redis::RedisBackend;
