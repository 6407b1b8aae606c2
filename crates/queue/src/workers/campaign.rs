//! Campaign worker. Lowest priority: bulk sends, paced to stay under the
//! provider's sending limits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_channel::{ChannelGateway, InstanceStore, LiveRegistry, OutboundMessage};

use crate::job::{Job, JobError};
use crate::jobs::{CampaignJob, JobPayload};
use crate::workers::JobHandler;

/// Handler for the `campaigns` queue.
///
/// Per-recipient failures are counted, not fatal: one bad number must not
/// burn the whole campaign's retry budget.
pub struct CampaignHandler {
    store: Arc<dyn InstanceStore>,
    registry: Arc<dyn LiveRegistry>,
    gateway: Arc<dyn ChannelGateway>,
    pace: Duration,
}

impl CampaignHandler {
    /// Create a campaign handler. `pace` is the delay between recipients.
    #[must_use]
    pub fn new(
        store: Arc<dyn InstanceStore>,
        registry: Arc<dyn LiveRegistry>,
        gateway: Arc<dyn ChannelGateway>,
        pace: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            gateway,
            pace,
        }
    }

    async fn live_channel_for(&self, tenant_id: &str) -> Result<Option<String>, JobError> {
        let instances = self
            .store
            .list_connected(Some(tenant_id))
            .await
            .map_err(|e| JobError::Retryable(e.to_string()))?;

        for instance in instances {
            if self.registry.is_live(tenant_id, &instance.id).await {
                return Ok(Some(instance.id));
            }
        }
        Ok(None)
    }

    fn render_template(campaign: &CampaignJob, recipient: &str) -> String {
        let mut rendered = campaign.template.clone();
        for (key, value) in &campaign.variables {
            rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
        }
        rendered.replace("{{recipient}}", recipient)
    }
}

#[async_trait]
impl JobHandler for CampaignHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let JobPayload::Campaign(campaign) = &job.payload else {
            return Err(JobError::Fatal(format!(
                "campaign worker received a non-campaign payload in job {}",
                job.id
            )));
        };

        tracing::info!(
            job_id = %job.id,
            campaign_id = %campaign.campaign_id,
            tenant_id = %campaign.tenant_id,
            recipients = campaign.recipients.len(),
            "Processing campaign"
        );

        let Some(channel_id) = self.live_channel_for(&campaign.tenant_id).await? else {
            return Err(JobError::ChannelUnavailable {
                tenant_id: campaign.tenant_id.clone(),
                channel_id: "none".into(),
                wait: false,
            });
        };

        let mut success_count = 0u32;
        let mut failed_count = 0u32;

        for (index, recipient) in campaign.recipients.iter().enumerate() {
            let text = Self::render_template(campaign, recipient);
            let send = self
                .gateway
                .send_text(&OutboundMessage {
                    tenant_id: campaign.tenant_id.clone(),
                    channel_id: channel_id.clone(),
                    to: recipient.clone(),
                    text,
                    // Per-recipient key: a re-delivered campaign re-sends
                    // under the same ids and the provider deduplicates.
                    message_id: format!("campaign-{}-{index}", campaign.campaign_id),
                })
                .await;

            match send {
                Ok(_) => success_count += 1,
                Err(err) if err.is_fatal() => {
                    // The session is gone; the rest of the list cannot send.
                    return Err(err.into());
                }
                Err(err) => {
                    tracing::warn!(
                        campaign_id = %campaign.campaign_id,
                        recipient = %recipient,
                        error = %err,
                        "Failed to send campaign message"
                    );
                    failed_count += 1;
                }
            }

            if index + 1 < campaign.recipients.len() {
                tokio::time::sleep(self.pace).await;
            }
        }

        tracing::info!(
            job_id = %job.id,
            campaign_id = %campaign.campaign_id,
            success_count,
            failed_count,
            "Campaign completed"
        );
        Ok(())
    }
}
