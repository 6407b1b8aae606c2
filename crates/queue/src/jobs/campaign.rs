//! Bulk campaign job.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A bulk send over a recipient list.
///
/// Recipients are paced to stay under the provider's sending limits;
/// individual failures are counted but do not fail the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignJob {
    /// Campaign record that produced this job.
    pub campaign_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Recipient addresses.
    pub recipients: Vec<String>,
    /// Message template with `{{variable}}` placeholders.
    pub template: String,
    /// Values substituted into the template.
    #[serde(default)]
    pub variables: HashMap<String, String>,
}
