//! Circuit breaker guarding a protected resource.
//!
//! One breaker instance protects one resource (the shared cache, the channel
//! provider). States: `Closed` (calls pass), `Open` (fail fast until the
//! cool-down elapses), `HalfOpen` (a single probe call admitted at a time).

use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use courier_common::config::BreakerSettings;
use serde::Serialize;

/// Errors that can short-circuit the breaker open.
///
/// A capacity/quota violation reported by the protected resource opens the
/// breaker immediately instead of waiting for the consecutive-failure
/// threshold.
pub trait BreakerError {
    /// Whether this error is an explicit capacity/quota violation.
    fn is_capacity_exceeded(&self) -> bool;
}

impl BreakerError for crate::CacheError {
    fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::CapacityExceeded(_))
    }
}

/// Breaker state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Normal operation, all calls pass through.
    Closed,
    /// Failing, all calls rejected until the cool-down elapses.
    Open,
    /// Recovering, one probe call admitted at a time.
    HalfOpen,
}

/// Diagnostic snapshot for operational dashboards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    /// Current state.
    pub state: BreakerState,
    /// Consecutive failures recorded.
    pub failure_count: u32,
    /// Successes recorded while half-open.
    pub success_count: u32,
    /// When the last failure was recorded.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Whether a call would be admitted right now.
    pub can_execute: bool,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

/// Circuit breaker with consecutive-failure tracking.
///
/// All methods take `&self`; state lives behind a mutex with short critical
/// sections so the breaker can be shared via `Arc` across the request path
/// and the worker pools.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker for the named resource.
    #[must_use]
    pub fn new(name: &'static str, settings: BreakerSettings) -> Self {
        Self {
            name,
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a call may be attempted right now.
    ///
    /// While `Open`, the first check after the cool-down transitions to
    /// `HalfOpen` and admits a single probe; further checks return `false`
    /// until the probe's outcome is recorded.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();

        // Unconditional reset after sitting in a failing state too long.
        // Prevents a permanent lockout from a wedged counter.
        if inner.state != BreakerState::Closed {
            if let Some(last) = inner.last_failure {
                if last.elapsed() > self.settings.reset_window() {
                    tracing::warn!(breaker = self.name, "Circuit breaker hard reset to CLOSED");
                    Self::clear(&mut inner);
                    return true;
                }
            }
        }

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = inner
                    .last_failure
                    .is_some_and(|last| last.elapsed() > self.settings.cooldown());
                if cooled {
                    tracing::info!(breaker = self.name, "Circuit breaker transitioning to HALF_OPEN");
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful protected call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;

        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
            inner.success_count += 1;

            if inner.success_count >= self.settings.success_threshold {
                tracing::info!(breaker = self.name, "Circuit breaker CLOSED (recovered)");
                Self::clear(&mut inner);
            }
        }
    }

    /// Record a failed protected call.
    pub fn record_failure<E: BreakerError + std::fmt::Display>(&self, error: &E) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.probe_in_flight = false;

        if error.is_capacity_exceeded() {
            tracing::error!(
                breaker = self.name,
                error = %error,
                "Capacity limit exceeded - opening circuit breaker"
            );
            inner.state = BreakerState::Open;
            inner.failure_count = self.settings.failure_threshold;
            inner.success_count = 0;
            return;
        }

        match inner.state {
            BreakerState::HalfOpen => {
                tracing::warn!(
                    breaker = self.name,
                    error = %error,
                    "Probe failed - circuit breaker back to OPEN"
                );
                inner.state = BreakerState::Open;
                inner.success_count = 0;
            }
            BreakerState::Closed if inner.failure_count >= self.settings.failure_threshold => {
                tracing::error!(
                    breaker = self.name,
                    failure_count = inner.failure_count,
                    error = %error,
                    "Circuit breaker OPEN"
                );
                inner.state = BreakerState::Open;
            }
            _ => {}
        }
    }

    /// Manual override back to `Closed`.
    pub fn reset(&self) {
        tracing::info!(breaker = self.name, "Circuit breaker manual reset to CLOSED");
        let mut inner = self.lock();
        Self::clear(&mut inner);
        inner.last_failure = None;
        inner.last_failure_at = None;
    }

    /// Diagnostic snapshot. Does not mutate breaker state.
    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        let can_execute = match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => inner
                .last_failure
                .is_some_and(|last| last.elapsed() > self.settings.cooldown()),
            BreakerState::HalfOpen => !inner.probe_in_flight,
        };

        BreakerStatus {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            can_execute,
        }
    }

    fn clear(inner: &mut Inner) {
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.probe_in_flight = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only happens if a panic occurred mid-transition;
        // the state is still a valid machine position, so keep going.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheError;
    use std::time::Duration;

    fn settings(cooldown_secs: u64, reset_secs: u64) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown_secs,
            reset_window_secs: reset_secs,
        }
    }

    fn backend_error() -> CacheError {
        CacheError::Backend("connection refused".into())
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", settings(60, 300));

        for _ in 0..4 {
            breaker.record_failure(&backend_error());
            assert!(breaker.can_execute());
        }

        breaker.record_failure(&backend_error());
        assert!(!breaker.can_execute());
        assert_eq!(breaker.status().state, BreakerState::Open);
    }

    #[test]
    fn test_success_resets_failure_count_while_closed() {
        let breaker = CircuitBreaker::new("test", settings(60, 300));

        for _ in 0..4 {
            breaker.record_failure(&backend_error());
        }
        breaker.record_success();
        assert_eq!(breaker.status().failure_count, 0);

        // Needs a full run of consecutive failures again.
        for _ in 0..4 {
            breaker.record_failure(&backend_error());
        }
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_capacity_error_opens_immediately() {
        let breaker = CircuitBreaker::new("test", settings(60, 300));

        breaker.record_failure(&CacheError::CapacityExceeded("max requests limit exceeded".into()));

        assert_eq!(breaker.status().state, BreakerState::Open);
        assert!(!breaker.can_execute());
    }

    #[tokio::test]
    async fn test_half_open_admits_single_probe() {
        let breaker = CircuitBreaker::new("test", settings(0, 300));

        for _ in 0..5 {
            breaker.record_failure(&backend_error());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Cool-down elapsed: exactly one probe is admitted.
        assert!(breaker.can_execute());
        assert_eq!(breaker.status().state, BreakerState::HalfOpen);
        assert!(!breaker.can_execute());

        // First success frees the next probe.
        breaker.record_success();
        assert!(breaker.can_execute());
        breaker.record_success();

        // Two successes close the breaker and zero both counters.
        let status = breaker.status();
        assert_eq!(status.state, BreakerState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.success_count, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", settings(0, 300));

        for _ in 0..5 {
            breaker.record_failure(&backend_error());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(breaker.can_execute());
        breaker.record_failure(&backend_error());

        assert_eq!(breaker.status().state, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_hard_reset_after_long_failing_window() {
        let breaker = CircuitBreaker::new("test", settings(3600, 0));

        for _ in 0..5 {
            breaker.record_failure(&backend_error());
        }
        assert_eq!(breaker.status().state, BreakerState::Open);

        // Reset window (0s) elapses long before the 1h cool-down would.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.can_execute());
        assert_eq!(breaker.status().state, BreakerState::Closed);
    }

    #[test]
    fn test_manual_reset() {
        let breaker = CircuitBreaker::new("test", settings(60, 300));

        for _ in 0..5 {
            breaker.record_failure(&backend_error());
        }
        breaker.reset();

        let status = breaker.status();
        assert_eq!(status.state, BreakerState::Closed);
        assert_eq!(status.failure_count, 0);
        assert!(status.last_failure_at.is_none());
        assert!(breaker.can_execute());
    }
}
