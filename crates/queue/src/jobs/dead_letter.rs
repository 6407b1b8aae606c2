//! Dead-letter entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A job that exhausted its retries, preserved with full context.
///
/// Dead-letter entries are never retried automatically; they exist so an
/// operator can diagnose the failure and decide what to do with the work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterJob {
    /// Queue the job came from.
    pub origin_queue: String,
    /// Id the job had in its origin queue.
    pub origin_job_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Original payload, unmodified.
    pub payload: serde_json::Value,
    /// The terminal error.
    pub error: String,
    /// When the job exhausted its attempts.
    pub failed_at: DateTime<Utc>,
}
