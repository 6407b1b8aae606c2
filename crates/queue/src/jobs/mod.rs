//! Job payload definitions.

mod automation;
mod campaign;
mod dead_letter;
mod message;

pub use automation::{AutomationJob, AutomationKind};
pub use campaign::CampaignJob;
pub use dead_letter::DeadLetterJob;
pub use message::MessageJob;

use serde::{Deserialize, Serialize};

/// Tagged payload, one variant per queue.
///
/// Workers dispatch on the variant exhaustively; a payload in the wrong
/// queue is a fatal handler error, not a silent no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobPayload {
    /// Inbound real-time message.
    Message(MessageJob),
    /// Scheduled reminder, follow-up or one-shot send.
    Automation(AutomationJob),
    /// Bulk send to a recipient list.
    Campaign(CampaignJob),
    /// A job that exhausted its retries, preserved for diagnosis.
    DeadLetter(DeadLetterJob),
}

impl JobPayload {
    /// The tenant this payload is scoped to.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        match self {
            Self::Message(job) => &job.tenant_id,
            Self::Automation(job) => &job.tenant_id,
            Self::Campaign(job) => &job.tenant_id,
            Self::DeadLetter(job) => &job.tenant_id,
        }
    }
}
