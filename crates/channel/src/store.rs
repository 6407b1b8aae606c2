//! Persisted instance store abstraction.
//!
//! The hosted relational store is an external collaborator; the core only
//! needs the row-level operations below. [`MemoryInstanceStore`] backs the
//! test suites and embedded development mode.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use courier_common::{AppError, AppResult};
use tokio::sync::RwLock;

use crate::instance::{ChannelInstance, ChannelStatus};

/// Row-level access to persisted channel instances.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// All instances recorded as `Connected`, optionally scoped to a tenant.
    async fn list_connected(&self, tenant_id: Option<&str>) -> AppResult<Vec<ChannelInstance>>;

    /// Load one instance.
    async fn get(&self, tenant_id: &str, channel_id: &str) -> AppResult<Option<ChannelInstance>>;

    /// Insert or replace an instance record.
    async fn upsert(&self, instance: ChannelInstance) -> AppResult<()>;

    /// Move an instance to a new status.
    async fn set_status(
        &self,
        tenant_id: &str,
        channel_id: &str,
        status: ChannelStatus,
    ) -> AppResult<()>;

    /// Record a successful connection: status `Connected`, fresh
    /// `last_connected_at`, reconnect attempts cleared.
    async fn record_connected(
        &self,
        tenant_id: &str,
        channel_id: &str,
        session_ref: Option<String>,
    ) -> AppResult<()>;

    /// Increment the reconnect attempt counter; returns the new value.
    async fn bump_reconnect_attempts(&self, tenant_id: &str, channel_id: &str) -> AppResult<u32>;
}

/// In-memory [`InstanceStore`].
#[derive(Debug, Default)]
pub struct MemoryInstanceStore {
    instances: RwLock<HashMap<(String, String), ChannelInstance>>,
}

impl MemoryInstanceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(tenant_id: &str, channel_id: &str) -> (String, String) {
        (tenant_id.to_string(), channel_id.to_string())
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn list_connected(&self, tenant_id: Option<&str>) -> AppResult<Vec<ChannelInstance>> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| i.status == ChannelStatus::Connected)
            .filter(|i| tenant_id.is_none_or(|t| i.tenant_id == t))
            .cloned()
            .collect())
    }

    async fn get(&self, tenant_id: &str, channel_id: &str) -> AppResult<Option<ChannelInstance>> {
        let instances = self.instances.read().await;
        Ok(instances.get(&Self::key(tenant_id, channel_id)).cloned())
    }

    async fn upsert(&self, instance: ChannelInstance) -> AppResult<()> {
        let mut instances = self.instances.write().await;
        instances.insert(
            (instance.tenant_id.clone(), instance.id.clone()),
            instance,
        );
        Ok(())
    }

    async fn set_status(
        &self,
        tenant_id: &str,
        channel_id: &str,
        status: ChannelStatus,
    ) -> AppResult<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&Self::key(tenant_id, channel_id))
            .ok_or_else(|| AppError::NotFound(format!("channel instance {channel_id}")))?;
        instance.status = status;
        Ok(())
    }

    async fn record_connected(
        &self,
        tenant_id: &str,
        channel_id: &str,
        session_ref: Option<String>,
    ) -> AppResult<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&Self::key(tenant_id, channel_id))
            .ok_or_else(|| AppError::NotFound(format!("channel instance {channel_id}")))?;
        instance.status = ChannelStatus::Connected;
        instance.last_connected_at = Some(Utc::now());
        instance.reconnect_attempts = 0;
        if session_ref.is_some() {
            instance.session_ref = session_ref;
        }
        Ok(())
    }

    async fn bump_reconnect_attempts(&self, tenant_id: &str, channel_id: &str) -> AppResult<u32> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&Self::key(tenant_id, channel_id))
            .ok_or_else(|| AppError::NotFound(format!("channel instance {channel_id}")))?;
        instance.reconnect_attempts += 1;
        Ok(instance.reconnect_attempts)
    }
}
