//! Automation worker. Medium priority: reminders, follow-ups, scheduled sends.

use std::sync::Arc;

use async_trait::async_trait;
use courier_channel::{ChannelGateway, InstanceStore, LiveRegistry, OutboundMessage};

use crate::job::{Job, JobError};
use crate::jobs::JobPayload;
use crate::workers::JobHandler;

/// Handler for the `automations` queue.
pub struct AutomationHandler {
    store: Arc<dyn InstanceStore>,
    registry: Arc<dyn LiveRegistry>,
    gateway: Arc<dyn ChannelGateway>,
}

impl AutomationHandler {
    /// Create an automation handler.
    #[must_use]
    pub fn new(
        store: Arc<dyn InstanceStore>,
        registry: Arc<dyn LiveRegistry>,
        gateway: Arc<dyn ChannelGateway>,
    ) -> Self {
        Self {
            store,
            registry,
            gateway,
        }
    }

    /// Pick a live channel for the tenant: a persisted `Connected` instance
    /// that the registry also believes is live.
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
}

#[async_trait]
impl JobHandler for AutomationHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let JobPayload::Automation(automation) = &job.payload else {
            return Err(JobError::Fatal(format!(
                "automation worker received a non-automation payload in job {}",
                job.id
            )));
        };

        tracing::info!(
            job_id = %job.id,
            automation_id = %automation.automation_id,
            tenant_id = %automation.tenant_id,
            kind = ?automation.kind,
            recipient = %automation.recipient,
            "Processing automation"
        );

        let Some(channel_id) = self.live_channel_for(&automation.tenant_id).await? else {
            return Err(JobError::ChannelUnavailable {
                tenant_id: automation.tenant_id.clone(),
                channel_id: "none".into(),
                wait: automation.wait_for_channel,
            });
        };

        let receipt = self
            .gateway
            .send_text(&OutboundMessage {
                tenant_id: automation.tenant_id.clone(),
                channel_id,
                to: automation.recipient.clone(),
                text: automation.content.clone(),
                message_id: format!("automation-{}", automation.automation_id),
            })
            .await?;

        tracing::info!(
            job_id = %job.id,
            automation_id = %automation.automation_id,
            message_id = %receipt.message_id,
            "Automation completed"
        );
        Ok(())
    }
}
