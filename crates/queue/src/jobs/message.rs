//! Inbound message job.

use serde::{Deserialize, Serialize};

/// An inbound real-time message awaiting processing.
///
/// Highest-priority work: a tenant's customer is waiting on the other end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageJob {
    /// Owning tenant.
    pub tenant_id: String,
    /// Channel instance the message arrived on.
    pub channel_id: String,
    /// Sender address on the chat network.
    pub from: String,
    /// Message body.
    pub content: String,
    /// Stable provider-side message id. Replies derive their idempotency
    /// key from it, so a re-delivered job cannot double-send.
    pub message_id: String,
    /// Sender's display name, when the provider shares it.
    #[serde(default)]
    pub push_name: Option<String>,
}
