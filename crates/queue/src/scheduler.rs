//! Recurring job scheduler.
//!
//! Cron-driven producers for periodic work: daily summaries, weekly
//! reports, maintenance sweeps. Each firing enqueues through the manager
//! with a deterministic job id derived from the fire time, so a duplicated
//! tick (or two schedulers racing) cannot double-submit.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use courier_common::{AppError, AppResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::jobs::JobPayload;
use crate::manager::{EnqueueOpts, QueueManager, QueueName};

/// Registers cron schedules and drives them until shutdown.
pub struct RecurringScheduler {
    manager: Arc<QueueManager>,
    shutdown: watch::Sender<bool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RecurringScheduler {
    /// Create a scheduler over the queue manager.
    #[must_use]
    pub fn new(manager: Arc<QueueManager>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            manager,
            shutdown,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register a recurring submission.
    ///
    /// `pattern` is a cron expression evaluated in `timezone`. The schedule
    /// runs until [`RecurringScheduler::close`]. Fails fast on an invalid
    /// pattern rather than at first fire time.
    pub fn schedule_recurring(
        &self,
        name: &str,
        queue: QueueName,
        payload: JobPayload,
        pattern: &str,
        timezone: chrono_tz::Tz,
    ) -> AppResult<()> {
        let schedule = cron::Schedule::from_str(pattern)
            .map_err(|e| AppError::BadRequest(format!("invalid cron pattern {pattern:?}: {e}")))?;

        let manager = self.manager.clone();
        let mut shutdown = self.shutdown.subscribe();
        let name = name.to_string();

        tracing::info!(
            schedule = %name,
            queue = %queue,
            pattern,
            timezone = %timezone,
            "Recurring job scheduled"
        );

        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(timezone).next() else {
                    tracing::warn!(schedule = %name, "Cron schedule has no future fire times");
                    break;
                };

                let wait = (next.with_timezone(&Utc) - Utc::now())
                    .to_std()
                    .unwrap_or_default();
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                // Fire-time-derived id: re-submitting the same tick is a no-op.
                let job_id = format!("recurring-{name}-{}", next.timestamp());
                let result = manager
                    .enqueue(
                        queue,
                        payload.clone(),
                        EnqueueOpts {
                            job_id: Some(job_id.clone()),
                            ..Default::default()
                        },
                    )
                    .await;

                match result {
                    Ok(job_ref) => {
                        tracing::info!(schedule = %name, job_id = %job_ref.id, "Recurring job enqueued");
                    }
                    Err(err) => {
                        tracing::error!(schedule = %name, job_id = %job_id, error = %err, "Recurring enqueue failed");
                    }
                }
            }
        });

        self.handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    /// Stop all schedules.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for handle in handles {
            handle.abort();
        }
        tracing::info!("Recurring scheduler closed");
    }
}
