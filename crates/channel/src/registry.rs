//! In-process registry of live channel connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::config::ReconnectSettings;
use tokio::sync::RwLock;

use crate::gateway::{ChannelGateway, GatewayError};

/// Health snapshot of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    /// Whether a live connection exists.
    pub connected: bool,
    /// Reconnect attempts since the last stable connection.
    pub reconnect_attempts: u32,
    /// Last observed activity on the connection.
    pub last_activity: Option<DateTime<Utc>>,
}

/// Query surface the health supervisor and the job handlers depend on.
///
/// Kept narrow so the supervisor can be tested against a fake without a real
/// provider session.
#[async_trait]
pub trait LiveRegistry: Send + Sync {
    /// Whether a live connection exists for this (tenant, channel) pair.
    async fn is_live(&self, tenant_id: &str, channel_id: &str) -> bool;

    /// Health details for this pair.
    async fn health(&self, tenant_id: &str, channel_id: &str) -> ConnectionHealth;

    /// One immediate reconnect attempt, bypassing any backoff.
    async fn force_reconnect(&self, tenant_id: &str, channel_id: &str)
    -> Result<(), GatewayError>;

    /// Drop connections idle longer than `older_than` and delete their
    /// provider-side session artifacts. Returns how many were removed.
    async fn cleanup_sessions(&self, older_than: Duration) -> Result<u64, GatewayError>;
}

#[derive(Debug, Clone)]
struct LiveConnection {
    tenant_id: String,
    channel_id: String,
    session_ref: String,
    last_activity: DateTime<Utc>,
    reconnect_attempts: u32,
}

/// Production [`LiveRegistry`] over a [`ChannelGateway`].
///
/// The map is the source of truth for "live": a pair absent from the map has
/// no connection this process can send through, whatever the persisted store
/// believes.
pub struct ConnectionRegistry {
    gateway: Arc<dyn ChannelGateway>,
    reconnect: ReconnectSettings,
    connections: RwLock<HashMap<String, LiveConnection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(gateway: Arc<dyn ChannelGateway>, reconnect: ReconnectSettings) -> Self {
        Self {
            gateway,
            reconnect,
            connections: RwLock::new(HashMap::new()),
        }
    }

    fn key(tenant_id: &str, channel_id: &str) -> String {
        format!("{tenant_id}_{channel_id}")
    }

    /// Establish a connection, retrying transient failures with exponential
    /// backoff up to the configured attempt cap. Fatal errors abort at once.
    pub async fn establish(
        &self,
        tenant_id: &str,
        channel_id: &str,
    ) -> Result<String, GatewayError> {
        let mut last_error = GatewayError::Transport("no attempt made".into());

        for attempt in 0..self.reconnect.max_attempts {
            if attempt > 0 {
                let delay = self.reconnect.delay_for_attempt(attempt - 1);
                tracing::info!(
                    tenant_id,
                    channel_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                tokio::time::sleep(delay).await;
            }

            match self.gateway.connect(tenant_id, channel_id).await {
                Ok(session_ref) => {
                    self.insert(tenant_id, channel_id, session_ref.clone()).await;
                    tracing::info!(tenant_id, channel_id, "Channel connected");
                    return Ok(session_ref);
                }
                Err(err) if err.is_fatal() => {
                    tracing::error!(tenant_id, channel_id, error = %err, "Fatal connect error");
                    self.remove(tenant_id, channel_id).await;
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(tenant_id, channel_id, attempt, error = %err, "Connect attempt failed");
                    self.bump_attempts(tenant_id, channel_id).await;
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }

    /// Record activity on a connection (a message sent or received).
    pub async fn touch(&self, tenant_id: &str, channel_id: &str) {
        let key = Self::key(tenant_id, channel_id);
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(&key) {
            conn.last_activity = Utc::now();
        }
    }

    /// Tear down a connection and forget it.
    pub async fn drop_connection(&self, tenant_id: &str, channel_id: &str) {
        if let Err(err) = self.gateway.disconnect(tenant_id, channel_id).await {
            tracing::warn!(tenant_id, channel_id, error = %err, "Disconnect failed");
        }
        self.remove(tenant_id, channel_id).await;
    }

    async fn insert(&self, tenant_id: &str, channel_id: &str, session_ref: String) {
        let key = Self::key(tenant_id, channel_id);
        let mut connections = self.connections.write().await;
        connections.insert(
            key,
            LiveConnection {
                tenant_id: tenant_id.to_string(),
                channel_id: channel_id.to_string(),
                session_ref,
                last_activity: Utc::now(),
                reconnect_attempts: 0,
            },
        );
    }

    async fn remove(&self, tenant_id: &str, channel_id: &str) {
        let key = Self::key(tenant_id, channel_id);
        self.connections.write().await.remove(&key);
    }

    async fn bump_attempts(&self, tenant_id: &str, channel_id: &str) {
        let key = Self::key(tenant_id, channel_id);
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(&key) {
            conn.reconnect_attempts += 1;
        }
    }
}

#[async_trait]
impl LiveRegistry for ConnectionRegistry {
    async fn is_live(&self, tenant_id: &str, channel_id: &str) -> bool {
        let key = Self::key(tenant_id, channel_id);
        self.connections.read().await.contains_key(&key)
    }

    async fn health(&self, tenant_id: &str, channel_id: &str) -> ConnectionHealth {
        let key = Self::key(tenant_id, channel_id);
        let connections = self.connections.read().await;
        connections.get(&key).map_or(
            ConnectionHealth {
                connected: false,
                reconnect_attempts: 0,
                last_activity: None,
            },
            |conn| ConnectionHealth {
                connected: true,
                reconnect_attempts: conn.reconnect_attempts,
                last_activity: Some(conn.last_activity),
            },
        )
    }

    async fn force_reconnect(
        &self,
        tenant_id: &str,
        channel_id: &str,
    ) -> Result<(), GatewayError> {
        tracing::info!(tenant_id, channel_id, "Forcing immediate reconnect");

        // Best effort: the old session may already be gone provider-side.
        if let Err(err) = self.gateway.disconnect(tenant_id, channel_id).await {
            tracing::debug!(tenant_id, channel_id, error = %err, "Pre-reconnect disconnect failed");
        }

        match self.gateway.connect(tenant_id, channel_id).await {
            Ok(session_ref) => {
                self.insert(tenant_id, channel_id, session_ref).await;
                Ok(())
            }
            Err(err) => {
                self.remove(tenant_id, channel_id).await;
                Err(err)
            }
        }
    }

    async fn cleanup_sessions(&self, older_than: Duration) -> Result<u64, GatewayError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let stale: Vec<LiveConnection> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|conn| conn.last_activity < cutoff)
                .cloned()
                .collect()
        };

        let mut cleaned = 0;
        for conn in stale {
            tracing::info!(
                tenant_id = %conn.tenant_id,
                channel_id = %conn.channel_id,
                session_ref = %conn.session_ref,
                last_activity = %conn.last_activity,
                "Old session cleaned up"
            );
            self.drop_connection(&conn.tenant_id, &conn.channel_id).await;
            cleaned += 1;
        }

        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::gateway::{OutboundMessage, SendReceipt};

    /// Gateway fake that fails a configured number of connects before
    /// succeeding, or always fails fatally.
    struct FakeGateway {
        connect_calls: AtomicU32,
        failures_before_success: u32,
        fatal: bool,
    }

    impl FakeGateway {
        fn flaky(failures: u32) -> Self {
            Self {
                connect_calls: AtomicU32::new(0),
                failures_before_success: failures,
                fatal: false,
            }
        }

        fn revoked() -> Self {
            Self {
                connect_calls: AtomicU32::new(0),
                failures_before_success: u32::MAX,
                fatal: true,
            }
        }
    }

    #[async_trait]
    impl ChannelGateway for FakeGateway {
        async fn connect(&self, _tenant: &str, _channel: &str) -> Result<String, GatewayError> {
            let call = self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return Err(GatewayError::SessionRevoked);
            }
            if call < self.failures_before_success {
                Err(GatewayError::Transport("connection refused".into()))
            } else {
                Ok(format!("session-{call}"))
            }
        }

        async fn disconnect(&self, _tenant: &str, _channel: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn send_text(&self, _message: &OutboundMessage) -> Result<SendReceipt, GatewayError> {
            Ok(SendReceipt {
                message_id: "m1".into(),
                timestamp: Utc::now(),
            })
        }

        async fn is_up(&self, _tenant: &str, _channel: &str) -> bool {
            true
        }
    }

    fn fast_reconnect() -> ReconnectSettings {
        ReconnectSettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 1.5,
        }
    }

    #[tokio::test]
    async fn test_establish_retries_transient_failures() {
        let registry = ConnectionRegistry::new(Arc::new(FakeGateway::flaky(2)), fast_reconnect());

        let session = registry.establish("t1", "c1").await.unwrap();
        assert_eq!(session, "session-2");
        assert!(registry.is_live("t1", "c1").await);
    }

    #[tokio::test]
    async fn test_establish_gives_up_after_cap() {
        let registry = ConnectionRegistry::new(Arc::new(FakeGateway::flaky(10)), fast_reconnect());

        assert!(registry.establish("t1", "c1").await.is_err());
        assert!(!registry.is_live("t1", "c1").await);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_immediately() {
        let gateway = Arc::new(FakeGateway::revoked());
        let registry = ConnectionRegistry::new(gateway.clone(), fast_reconnect());

        match registry.establish("t1", "c1").await {
            Err(GatewayError::SessionRevoked) => {}
            other => panic!("Expected SessionRevoked, got {other:?}"),
        }
        // A revoked session is not worth a second attempt.
        assert_eq!(gateway.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_reconnect_restores_live_entry() {
        let registry = ConnectionRegistry::new(Arc::new(FakeGateway::flaky(0)), fast_reconnect());

        assert!(!registry.is_live("t1", "c1").await);
        registry.force_reconnect("t1", "c1").await.unwrap();
        assert!(registry.is_live("t1", "c1").await);

        let health = registry.health("t1", "c1").await;
        assert!(health.connected);
        assert_eq!(health.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_idle_sessions() {
        let registry = ConnectionRegistry::new(Arc::new(FakeGateway::flaky(0)), fast_reconnect());
        registry.establish("t1", "c1").await.unwrap();

        // Nothing is older than an hour yet.
        assert_eq!(
            registry.cleanup_sessions(Duration::from_secs(3600)).await.unwrap(),
            0
        );

        // Everything is older than zero seconds.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            registry.cleanup_sessions(Duration::ZERO).await.unwrap(),
            1
        );
        assert!(!registry.is_live("t1", "c1").await);
    }
}
