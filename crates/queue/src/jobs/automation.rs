//! Scheduled automation job.

use serde::{Deserialize, Serialize};

/// Kind of automation being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutomationKind {
    /// Appointment or payment reminder.
    Reminder,
    /// Conversation follow-up.
    Followup,
    /// One-shot scheduled send.
    Scheduled,
}

/// A scheduled send on behalf of a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationJob {
    /// Automation record that produced this job.
    pub automation_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// What kind of automation this is.
    pub kind: AutomationKind,
    /// Recipient address on the chat network.
    pub recipient: String,
    /// Message body.
    pub content: String,
    /// When the tenant's channel is down, reschedule for a delayed re-check
    /// instead of failing. Reminders can usually wait a minute.
    #[serde(default)]
    pub wait_for_channel: bool,
}
