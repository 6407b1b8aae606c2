//! Job record, retry policy and handler error taxonomy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_channel::GatewayError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jobs::JobPayload;
use crate::manager::QueueName;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    /// Ready to be leased by a worker.
    Waiting,
    /// Leased; a worker is executing it.
    Active,
    /// Finished successfully. Pruned by retention.
    Completed,
    /// Exhausted its attempts; the payload lives on in the dead-letter queue.
    Failed,
    /// Waiting out a backoff delay before re-entering the ready set.
    DelayedRetry,
}

/// Delay policy between retry attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BackoffPolicy {
    /// Same delay every time.
    Fixed {
        /// Delay in milliseconds.
        base_delay_ms: u64,
    },
    /// `base * 2^(attempts - 1)`. The default.
    Exponential {
        /// Base delay in milliseconds.
        base_delay_ms: u64,
    },
}

impl BackoffPolicy {
    /// Delay before the next attempt, given how many attempts have been made.
    #[must_use]
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        match self {
            Self::Fixed { base_delay_ms } => Duration::from_millis(*base_delay_ms),
            Self::Exponential { base_delay_ms } => {
                let factor = 2u64.saturating_pow(attempts.saturating_sub(1));
                Duration::from_millis(base_delay_ms.saturating_mul(factor))
            }
        }
    }
}

/// A unit of work in a named queue.
///
/// Mutated only by the worker holding its lease; everyone else sees it
/// through the manager's read operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Job id, unique within the queue.
    pub id: String,
    /// Queue this job belongs to.
    pub queue: QueueName,
    /// Priority; lower values are served first.
    pub priority: u8,
    /// Tenant-scoped payload.
    pub payload: JobPayload,
    /// Delivery attempts made so far. Never exceeds `max_attempts`.
    pub attempts: u32,
    /// Attempt budget before the job is dead-lettered.
    pub max_attempts: u32,
    /// Retry delay policy.
    pub backoff: BackoffPolicy,
    /// Lifecycle state.
    pub state: JobState,
    /// Times the job was re-delivered after an expired lease.
    pub stalled_count: u32,
    /// When the job was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// When the job becomes (or became) eligible for delivery.
    pub ready_at: DateTime<Utc>,
    /// Lease deadline while `Active`.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Most recent handler error.
    pub last_error: Option<String>,
}

/// Lightweight reference returned to job producers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    /// Job id.
    pub id: String,
    /// Queue the job was submitted to.
    pub queue: QueueName,
}

/// Handler outcome taxonomy.
///
/// Transient provider errors are retryable and consume the job's backoff
/// budget; fatal errors (a revoked session) skip retries and dead-letter
/// immediately.
#[derive(Debug, Error)]
pub enum JobError {
    /// Transient failure; the job is rescheduled with backoff.
    #[error("{0}")]
    Retryable(String),

    /// Permanent failure; the job goes straight to the dead-letter queue.
    #[error("{0}")]
    Fatal(String),

    /// The tenant's channel is not connected. With `wait` set, the job is
    /// rescheduled for a delayed re-check instead of failing outright.
    #[error("Channel unavailable for tenant {tenant_id}: {channel_id}")]
    ChannelUnavailable {
        /// Owning tenant.
        tenant_id: String,
        /// Channel instance id, or "none" when the tenant has no instance.
        channel_id: String,
        /// Whether the job opted into waiting for the channel.
        wait: bool,
    },
}

impl From<GatewayError> for JobError {
    fn from(err: GatewayError) -> Self {
        if err.is_fatal() {
            Self::Fatal(err.to_string())
        } else {
            Self::Retryable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles() {
        let backoff = BackoffPolicy::Exponential { base_delay_ms: 2000 };

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let backoff = BackoffPolicy::Fixed { base_delay_ms: 5000 };

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(5000));
        assert_eq!(backoff.delay_for_attempt(7), Duration::from_millis(5000));
    }

    #[test]
    fn test_exponential_backoff_saturates() {
        let backoff = BackoffPolicy::Exponential { base_delay_ms: u64::MAX / 2 };

        // No overflow panic on absurd attempt counts.
        let _ = backoff.delay_for_attempt(200);
    }

    #[test]
    fn test_gateway_error_mapping() {
        assert!(matches!(
            JobError::from(GatewayError::SessionRevoked),
            JobError::Fatal(_)
        ));
        assert!(matches!(
            JobError::from(GatewayError::Timeout),
            JobError::Retryable(_)
        ));
    }

    #[test]
    fn test_job_state_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&JobState::DelayedRetry).unwrap(),
            "\"delayedRetry\""
        );
    }
}
