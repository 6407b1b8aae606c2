//! Message worker. Highest priority: a customer is waiting.

use std::sync::Arc;

use async_trait::async_trait;
use courier_channel::{ChannelGateway, LiveRegistry, OutboundMessage};
use courier_common::AppResult;

use crate::job::{Job, JobError};
use crate::jobs::{JobPayload, MessageJob};
use crate::workers::JobHandler;

/// Composes the reply to an inbound message.
///
/// The conversation engine is a business-logic collaborator outside the
/// core; it plugs in here. Returning `None` means no reply should be sent
/// (for example, a conversation handed off to a human operator).
#[async_trait]
pub trait MessageResponder: Send + Sync {
    /// Produce the reply text for an inbound message, if any.
    async fn respond(&self, message: &MessageJob) -> AppResult<Option<String>>;
}

/// Handler for the `messages` queue.
pub struct MessageHandler {
    registry: Arc<dyn LiveRegistry>,
    gateway: Arc<dyn ChannelGateway>,
    responder: Arc<dyn MessageResponder>,
}

impl MessageHandler {
    /// Create a message handler.
    #[must_use]
    pub fn new(
        registry: Arc<dyn LiveRegistry>,
        gateway: Arc<dyn ChannelGateway>,
        responder: Arc<dyn MessageResponder>,
    ) -> Self {
        Self {
            registry,
            gateway,
            responder,
        }
    }
}

#[async_trait]
impl JobHandler for MessageHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let JobPayload::Message(message) = &job.payload else {
            return Err(JobError::Fatal(format!(
                "message worker received a non-message payload in job {}",
                job.id
            )));
        };

        tracing::info!(
            job_id = %job.id,
            tenant_id = %message.tenant_id,
            from = %message.from,
            message_id = %message.message_id,
            "Processing incoming message"
        );

        if !self
            .registry
            .is_live(&message.tenant_id, &message.channel_id)
            .await
        {
            return Err(JobError::ChannelUnavailable {
                tenant_id: message.tenant_id.clone(),
                channel_id: message.channel_id.clone(),
                wait: false,
            });
        }

        let reply = self
            .responder
            .respond(message)
            .await
            .map_err(|e| JobError::Retryable(e.to_string()))?;

        let Some(text) = reply else {
            tracing::debug!(
                job_id = %job.id,
                message_id = %message.message_id,
                "No reply produced for message"
            );
            return Ok(());
        };

        let receipt = self
            .gateway
            .send_text(&OutboundMessage {
                tenant_id: message.tenant_id.clone(),
                channel_id: message.channel_id.clone(),
                to: message.from.clone(),
                text,
                // Derived from the inbound id so a re-delivered job re-sends
                // under the same key and the provider deduplicates.
                message_id: format!("reply-{}", message.message_id),
            })
            .await?;

        tracing::info!(
            job_id = %job.id,
            message_id = %receipt.message_id,
            "Reply sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use courier_channel::{ConnectionHealth, GatewayError, SendReceipt};

    use crate::job::{BackoffPolicy, JobState};
    use crate::manager::QueueName;

    struct StaticRegistry(bool);

    #[async_trait]
    impl LiveRegistry for StaticRegistry {
        async fn is_live(&self, _tenant: &str, _channel: &str) -> bool {
            self.0
        }

        async fn health(&self, _tenant: &str, _channel: &str) -> ConnectionHealth {
            ConnectionHealth {
                connected: self.0,
                reconnect_attempts: 0,
                last_activity: None,
            }
        }

        async fn force_reconnect(&self, _tenant: &str, _channel: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn cleanup_sessions(&self, _older_than: Duration) -> Result<u64, GatewayError> {
            Ok(0)
        }
    }

    struct RecordingGateway {
        sends: AtomicU32,
    }

    #[async_trait]
    impl ChannelGateway for RecordingGateway {
        async fn connect(&self, _tenant: &str, _channel: &str) -> Result<String, GatewayError> {
            Ok("session".into())
        }

        async fn disconnect(&self, _tenant: &str, _channel: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn send_text(&self, message: &OutboundMessage) -> Result<SendReceipt, GatewayError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(SendReceipt {
                message_id: message.message_id.clone(),
                timestamp: Utc::now(),
            })
        }

        async fn is_up(&self, _tenant: &str, _channel: &str) -> bool {
            true
        }
    }

    struct EchoResponder;

    #[async_trait]
    impl MessageResponder for EchoResponder {
        async fn respond(&self, message: &MessageJob) -> AppResult<Option<String>> {
            Ok(Some(format!("echo: {}", message.content)))
        }
    }

    fn message_job() -> Job {
        Job {
            id: "m1".into(),
            queue: QueueName::Messages,
            priority: 1,
            payload: JobPayload::Message(MessageJob {
                tenant_id: "t1".into(),
                channel_id: "c1".into(),
                from: "5511999@provider".into(),
                content: "hi".into(),
                message_id: "prov-1".into(),
                push_name: None,
            }),
            attempts: 1,
            max_attempts: 3,
            backoff: BackoffPolicy::Exponential { base_delay_ms: 2000 },
            state: JobState::Active,
            stalled_count: 0,
            enqueued_at: Utc::now(),
            ready_at: Utc::now(),
            lease_expires_at: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_replies_through_gateway_when_live() {
        let gateway = Arc::new(RecordingGateway {
            sends: AtomicU32::new(0),
        });
        let handler = MessageHandler::new(
            Arc::new(StaticRegistry(true)),
            gateway.clone(),
            Arc::new(EchoResponder),
        );

        handler.handle(&message_job()).await.unwrap();
        assert_eq!(gateway.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fails_fast_when_channel_down() {
        let gateway = Arc::new(RecordingGateway {
            sends: AtomicU32::new(0),
        });
        let handler = MessageHandler::new(
            Arc::new(StaticRegistry(false)),
            gateway.clone(),
            Arc::new(EchoResponder),
        );

        match handler.handle(&message_job()).await {
            Err(JobError::ChannelUnavailable { wait: false, .. }) => {}
            other => panic!("Expected ChannelUnavailable, got {other:?}"),
        }
        assert_eq!(gateway.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wrong_payload_is_fatal() {
        let handler = MessageHandler::new(
            Arc::new(StaticRegistry(true)),
            Arc::new(RecordingGateway {
                sends: AtomicU32::new(0),
            }),
            Arc::new(EchoResponder),
        );

        let mut job = message_job();
        job.payload = JobPayload::Campaign(crate::jobs::CampaignJob {
            campaign_id: "x".into(),
            tenant_id: "t1".into(),
            recipients: vec![],
            template: String::new(),
            variables: std::collections::HashMap::new(),
        });

        assert!(matches!(handler.handle(&job).await, Err(JobError::Fatal(_))));
    }
}
