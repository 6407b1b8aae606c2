//! ID generation utilities.

use ulid::Ulid;
use uuid::Uuid;

/// ID generator for jobs and entities.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    _private: (),
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Generate a new ULID-based ID.
    ///
    /// ULIDs are lexicographically sortable and monotonically increasing
    /// within the same millisecond, which keeps equal-priority jobs in
    /// submission order.
    #[must_use]
    pub fn generate(&self) -> String {
        Ulid::new().to_string().to_lowercase()
    }

    /// Generate a new random UUID v4.
    #[must_use]
    pub fn generate_uuid_v4(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Derive a deterministic job id from queue, tenant and timestamp.
    ///
    /// Callers that want idempotent submission pass the same triple twice
    /// and receive the same id.
    #[must_use]
    pub fn job_id(queue: &str, tenant_id: &str, timestamp_ms: i64) -> String {
        format!("{queue}-{tenant_id}-{timestamp_ms}")
    }
}
