//! Connection health supervisor.
//!
//! A singleton periodic pass that reconciles the store's belief about which
//! tenant channels are connected against the in-process live registry, and
//! repairs the difference: zombie instances get one bounded reconnect per
//! cycle, repeated failures are marked `Failed`, and stale session artifacts
//! are expired.

use std::sync::Arc;

use courier_common::AppResult;
use courier_common::config::HealthSettings;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::instance::ChannelStatus;
use crate::registry::LiveRegistry;
use crate::store::InstanceStore;

/// What kind of pass is running. Session cleanup only happens on periodic
/// passes so a manual trigger stays cheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Fixed-interval pass started by the supervisor loop.
    Periodic,
    /// On-demand pass from the operations surface.
    Manual,
}

/// Structured summary of one supervisor pass.
///
/// This is the only interface surface exposed to callers.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Instances checked.
    pub total_instances: usize,
    /// Instances live and healthy.
    pub healthy_instances: usize,
    /// Zombies successfully reconnected.
    pub reconnected_instances: usize,
    /// Instances that failed their reconnect attempt.
    pub failed_instances: usize,
    /// Stale sessions expired (periodic passes only).
    pub cleaned_sessions: u64,
    /// Free-text alerts raised during the pass.
    pub alerts: Vec<String>,
}

/// Singleton supervisor over persisted instances and live connections.
pub struct HealthSupervisor {
    store: Arc<dyn InstanceStore>,
    registry: Arc<dyn LiveRegistry>,
    settings: HealthSettings,
    // Exclusive run slot: two overlapping passes would issue duplicate
    // reconnects for the same tenant.
    run_slot: Mutex<()>,
}

impl HealthSupervisor {
    /// Create a supervisor.
    #[must_use]
    pub fn new(
        store: Arc<dyn InstanceStore>,
        registry: Arc<dyn LiveRegistry>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
            run_slot: Mutex::new(()),
        }
    }

    /// Run one periodic pass over every tenant.
    pub async fn run_periodic(&self) -> AppResult<HealthReport> {
        self.run(CheckKind::Periodic, None).await
    }

    /// Run an on-demand pass, optionally scoped to one tenant.
    pub async fn trigger_manual_check(&self, tenant_id: Option<&str>) -> AppResult<HealthReport> {
        tracing::info!(tenant_id, "Manual health check triggered");
        self.run(CheckKind::Manual, tenant_id).await
    }

    /// Synchronous connectivity query used by job handlers before sending.
    pub async fn is_connected(&self, channel_id: &str, tenant_id: &str) -> bool {
        self.registry.is_live(tenant_id, channel_id).await
    }

    async fn run(&self, kind: CheckKind, tenant_id: Option<&str>) -> AppResult<HealthReport> {
        let _slot = self.run_slot.lock().await;

        tracing::info!(kind = ?kind, tenant_id, "Running channel health check");

        let mut report = HealthReport::default();
        let instances = self.store.list_connected(tenant_id).await?;
        report.total_instances = instances.len();

        for instance in instances {
            if self.registry.is_live(&instance.tenant_id, &instance.id).await {
                report.healthy_instances += 1;

                let health = self.registry.health(&instance.tenant_id, &instance.id).await;
                if health.reconnect_attempts > 0 {
                    report.alerts.push(format!(
                        "Instance {} (tenant {}) had {} reconnect attempts",
                        instance.id, instance.tenant_id, health.reconnect_attempts
                    ));
                }
            } else {
                // Zombie: recorded as connected but no live connection exists.
                tracing::warn!(
                    channel_id = %instance.id,
                    tenant_id = %instance.tenant_id,
                    "Zombie instance detected, attempting reconnect"
                );
                report.alerts.push(format!(
                    "Zombie instance detected: {} (tenant {})",
                    instance.id, instance.tenant_id
                ));

                self.repair_zombie(&instance.tenant_id, &instance.id, &mut report)
                    .await?;
            }
        }

        if kind == CheckKind::Periodic {
            match self
                .registry
                .cleanup_sessions(self.settings.session_max_age())
                .await
            {
                Ok(cleaned) => {
                    report.cleaned_sessions = cleaned;
                    if cleaned > 0 {
                        tracing::info!(cleaned, "Old sessions cleaned up");
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "Failed to cleanup old sessions");
                }
            }
        }

        if report.failed_instances > 0 || report.reconnected_instances > 0 {
            report.alerts.push(format!(
                "Health check summary: {}/{} healthy, {} reconnected, {} failed",
                report.healthy_instances,
                report.total_instances,
                report.reconnected_instances,
                report.failed_instances
            ));
        }

        tracing::info!(
            total = report.total_instances,
            healthy = report.healthy_instances,
            reconnected = report.reconnected_instances,
            failed = report.failed_instances,
            cleaned_sessions = report.cleaned_sessions,
            alert_count = report.alerts.len(),
            "Channel health check completed"
        );

        Ok(report)
    }

    /// One reconnect attempt for a zombie instance. A session revoked by the
    /// provider goes straight to `Failed`; transient failures count against
    /// the configured cap.
    async fn repair_zombie(
        &self,
        tenant_id: &str,
        channel_id: &str,
        report: &mut HealthReport,
    ) -> AppResult<()> {
        match self.registry.force_reconnect(tenant_id, channel_id).await {
            Ok(()) => {
                report.reconnected_instances += 1;
                self.store.record_connected(tenant_id, channel_id, None).await?;
                tracing::info!(channel_id, tenant_id, "Zombie instance reconnected");
            }
            Err(err) if err.is_fatal() => {
                report.failed_instances += 1;
                report.alerts.push(format!(
                    "Instance {channel_id} (tenant {tenant_id}) failed permanently: {err}"
                ));
                self.store
                    .set_status(tenant_id, channel_id, ChannelStatus::Failed)
                    .await?;
                tracing::error!(channel_id, tenant_id, error = %err, "Instance session is gone, marked failed");
            }
            Err(err) => {
                report.failed_instances += 1;
                let attempts = self.store.bump_reconnect_attempts(tenant_id, channel_id).await?;
                report.alerts.push(format!(
                    "Failed to reconnect instance {channel_id} (tenant {tenant_id}): {err}"
                ));
                tracing::error!(
                    channel_id,
                    tenant_id,
                    attempts,
                    error = %err,
                    "Failed to reconnect zombie instance"
                );

                if attempts > self.settings.reconnect_cap {
                    self.store
                        .set_status(tenant_id, channel_id, ChannelStatus::Failed)
                        .await?;
                    report.alerts.push(format!(
                        "Instance {channel_id} (tenant {tenant_id}) exceeded {} reconnect attempts, marked failed",
                        self.settings.reconnect_cap
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Spawn the supervisor loop: one pass per configured interval, forever.
pub async fn run_supervisor(supervisor: Arc<HealthSupervisor>, settings: HealthSettings) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(settings.interval());
        // The first tick fires immediately; skip it so startup connects have
        // a full interval to settle before the first reconciliation.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = supervisor.run_periodic().await {
                tracing::error!(error = %e, "Channel health check failed");
            }
        }
    });
}
