//! Persisted channel instance model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection lifecycle of a tenant's channel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// No session; nothing is trying to connect.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Waiting for the tenant to confirm the pairing on their device.
    AwaitingVerification,
    /// Session is established and messages flow.
    Connected,
    /// Terminal. The instance is superseded by a fresh record, never revived.
    Failed,
}

impl ChannelStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingVerification => "awaiting_verification",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One persisted channel session per (tenant, channel) pair.
///
/// Instances are never hard-deleted: a dead instance transitions to
/// [`ChannelStatus::Failed`] and a fresh record supersedes it. At most one
/// non-terminal instance exists per pair; the store and the in-process
/// registry are reconciled every health cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInstance {
    /// Channel instance id.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Current lifecycle status.
    pub status: ChannelStatus,
    /// When the instance last reached `Connected`.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Reconnect attempts since the last successful connection.
    pub reconnect_attempts: u32,
    /// Opaque handle to the provider's session.
    pub session_ref: Option<String>,
}

impl ChannelInstance {
    /// Create a fresh instance record in `Disconnected` state.
    #[must_use]
    pub const fn new(id: String, tenant_id: String) -> Self {
        Self {
            id,
            tenant_id,
            status: ChannelStatus::Disconnected,
            last_connected_at: None,
            reconnect_attempts: 0,
            session_ref: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_failed_is_terminal() {
        assert!(ChannelStatus::Failed.is_terminal());
        assert!(!ChannelStatus::Connected.is_terminal());
        assert!(!ChannelStatus::Disconnected.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ChannelStatus::AwaitingVerification).unwrap();
        assert_eq!(json, "\"awaiting_verification\"");
    }
}
