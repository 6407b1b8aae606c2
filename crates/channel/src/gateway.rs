//! External chat network gateway.
//!
//! [`ChannelGateway`] abstracts the provider's session API so workers, the
//! registry and the tests do not care whether there is a real network behind
//! it. The production [`HttpGateway`] speaks the provider's HTTP API through
//! its own circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_cache::{BreakerError, CircuitBreaker};
use courier_common::config::GatewayConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the channel provider.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network-level failure. Transient, retried with backoff.
    #[error("Provider request failed: {0}")]
    Transport(String),

    /// The provider did not answer in time. Transient.
    #[error("Provider request timed out")]
    Timeout,

    /// The tenant revoked the session on their device. Fatal, never retried.
    #[error("Session revoked by provider")]
    SessionRevoked,

    /// Another client took over the session. Fatal, never retried.
    #[error("Session replaced by another client")]
    SessionReplaced,

    /// The provider reported a capacity/quota violation.
    #[error("Provider capacity limit exceeded")]
    CapacityExceeded,

    /// The channel has no live session to send through.
    #[error("Channel not connected: {0}")]
    NotConnected(String),

    /// The gateway circuit breaker rejected the call.
    #[error("Gateway circuit breaker is open")]
    BreakerOpen,
}

impl GatewayError {
    /// Fatal errors mean the session is gone for good; reconnecting with the
    /// same credentials will not help.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionRevoked | Self::SessionReplaced)
    }
}

impl BreakerError for GatewayError {
    fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::CapacityExceeded)
    }
}

/// An outbound text message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Owning tenant.
    pub tenant_id: String,
    /// Channel instance to send through.
    pub channel_id: String,
    /// Recipient address on the chat network.
    pub to: String,
    /// Message body.
    pub text: String,
    /// Stable, caller-supplied message id. The provider deduplicates on it,
    /// which makes re-delivered jobs safe to re-send.
    pub message_id: String,
}

/// Receipt returned by the provider for an accepted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    /// Provider-side message id.
    pub message_id: String,
    /// When the provider accepted the message.
    pub timestamp: DateTime<Utc>,
}

/// Client for the external chat network.
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    /// Establish a session; returns the provider's opaque session handle.
    async fn connect(&self, tenant_id: &str, channel_id: &str) -> Result<String, GatewayError>;

    /// Tear down a session and delete its provider-side artifacts.
    async fn disconnect(&self, tenant_id: &str, channel_id: &str) -> Result<(), GatewayError>;

    /// Send a text message through an established session.
    async fn send_text(&self, message: &OutboundMessage) -> Result<SendReceipt, GatewayError>;

    /// Whether the provider reports the session as up.
    async fn is_up(&self, tenant_id: &str, channel_id: &str) -> bool;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectResponse {
    session_ref: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    connected: bool,
}

/// HTTP implementation of [`ChannelGateway`].
///
/// Every call goes through the gateway's own [`CircuitBreaker`], separate
/// from the cache breaker, so a provider outage fails fast without hiding
/// cache health.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
}

impl HttpGateway {
    /// Create a gateway client from configuration.
    pub fn new(config: &GatewayConfig, breaker: Arc<CircuitBreaker>) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            breaker,
        })
    }

    /// The breaker guarding provider calls.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn instance_url(&self, tenant_id: &str, channel_id: &str, tail: &str) -> String {
        format!(
            "{}/v1/instances/{tenant_id}/{channel_id}/{tail}",
            self.base_url
        )
    }

    fn classify(status: reqwest::StatusCode, body: String) -> GatewayError {
        match status.as_u16() {
            401 | 403 => GatewayError::SessionRevoked,
            409 => GatewayError::SessionReplaced,
            429 => GatewayError::CapacityExceeded,
            _ => GatewayError::Transport(format!("status {status}: {body}")),
        }
    }

    fn map_request_error(err: &reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Transport(err.to_string())
        }
    }

    async fn guarded<T, F>(&self, call: F) -> Result<T, GatewayError>
    where
        F: std::future::Future<Output = Result<T, GatewayError>>,
    {
        if !self.breaker.can_execute() {
            return Err(GatewayError::BreakerOpen);
        }

        match call.await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(err) => {
                self.breaker.record_failure(&err);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl ChannelGateway for HttpGateway {
    async fn connect(&self, tenant_id: &str, channel_id: &str) -> Result<String, GatewayError> {
        let url = self.instance_url(tenant_id, channel_id, "connect");
        self.guarded(async {
            let response = self
                .client
                .post(&url)
                .send()
                .await
                .map_err(|e| Self::map_request_error(&e))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Self::classify(status, body));
            }

            let parsed: ConnectResponse = response
                .json()
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
            Ok(parsed.session_ref)
        })
        .await
    }

    async fn disconnect(&self, tenant_id: &str, channel_id: &str) -> Result<(), GatewayError> {
        let url = self.instance_url(tenant_id, channel_id, "disconnect");
        self.guarded(async {
            let response = self
                .client
                .post(&url)
                .send()
                .await
                .map_err(|e| Self::map_request_error(&e))?;

            let status = response.status();
            if status.is_success() || status.as_u16() == 404 {
                // 404 means the provider already forgot the session.
                Ok(())
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(Self::classify(status, body))
            }
        })
        .await
    }

    async fn send_text(&self, message: &OutboundMessage) -> Result<SendReceipt, GatewayError> {
        let url = self.instance_url(&message.tenant_id, &message.channel_id, "messages");
        self.guarded(async {
            let response = self
                .client
                .post(&url)
                .json(&serde_json::json!({
                    "to": message.to,
                    "text": message.text,
                    "messageId": message.message_id,
                }))
                .send()
                .await
                .map_err(|e| Self::map_request_error(&e))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Self::classify(status, body));
            }

            let receipt: SendReceipt = response
                .json()
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;

            tracing::debug!(
                tenant_id = %message.tenant_id,
                channel_id = %message.channel_id,
                message_id = %receipt.message_id,
                "Message accepted by provider"
            );
            Ok(receipt)
        })
        .await
    }

    async fn is_up(&self, tenant_id: &str, channel_id: &str) -> bool {
        let url = self.instance_url(tenant_id, channel_id, "status");
        let result = self
            .guarded(async {
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| Self::map_request_error(&e))?;

                if !response.status().is_success() {
                    return Ok(StatusResponse { connected: false });
                }
                response
                    .json::<StatusResponse>()
                    .await
                    .map_err(|e| GatewayError::Transport(e.to_string()))
            })
            .await;

        result.map(|s| s.connected).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(GatewayError::SessionRevoked.is_fatal());
        assert!(GatewayError::SessionReplaced.is_fatal());
        assert!(!GatewayError::Timeout.is_fatal());
        assert!(!GatewayError::Transport("boom".into()).is_fatal());
    }

    #[test]
    fn test_capacity_opens_breaker() {
        assert!(GatewayError::CapacityExceeded.is_capacity_exceeded());
        assert!(!GatewayError::Timeout.is_capacity_exceeded());
    }

    #[test]
    fn test_status_code_mapping() {
        let revoked = HttpGateway::classify(reqwest::StatusCode::UNAUTHORIZED, String::new());
        assert!(matches!(revoked, GatewayError::SessionRevoked));

        let replaced = HttpGateway::classify(reqwest::StatusCode::CONFLICT, String::new());
        assert!(matches!(replaced, GatewayError::SessionReplaced));

        let quota = HttpGateway::classify(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new());
        assert!(matches!(quota, GatewayError::CapacityExceeded));

        let server = HttpGateway::classify(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "oops".to_string(),
        );
        assert!(matches!(server, GatewayError::Transport(_)));
    }
}
