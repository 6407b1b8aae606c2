//! Per-queue worker pools.
//!
//! Each pool runs a bounded number of executors that lease one job at a
//! time, run the queue's handler and report the outcome back to the
//! manager. A maintenance task per pool promotes due delayed jobs and
//! re-delivers expired leases.

mod automation;
mod campaign;
mod message;

pub use automation::AutomationHandler;
pub use campaign::CampaignHandler;
pub use message::{MessageHandler, MessageResponder};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::job::{Job, JobError};
use crate::manager::{FailDisposition, FailureKind, QueueManager, QueueName};

/// Cadence of the per-pool maintenance task.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Executes one queue's jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run a single job. The worker owns the lease for the duration.
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

/// What happened to a processed job. Emitted on the pool's outcome channel
/// for logging and alerting collaborators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    /// Job id.
    pub job_id: String,
    /// Queue the job ran in.
    pub queue: QueueName,
    /// Owning tenant.
    pub tenant_id: String,
    /// Attempts consumed so far.
    pub attempts: u32,
    /// Result of this attempt.
    pub result: OutcomeKind,
}

/// Outcome variants.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OutcomeKind {
    /// Handler succeeded.
    Completed,
    /// Handler failed; the job was rescheduled.
    Rescheduled {
        /// Delay until the next attempt, in milliseconds.
        delay_ms: u64,
    },
    /// Retries exhausted or failure was fatal; the job was dead-lettered.
    DeadLettered {
        /// The terminal error.
        error: String,
    },
}

/// A bounded pool of concurrent executors for one queue.
pub struct WorkerPool {
    queue: QueueName,
    shutdown: watch::Sender<bool>,
    outcomes: broadcast::Sender<JobOutcome>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `concurrency` executors plus the maintenance task.
    #[must_use]
    pub fn start(
        queue: QueueName,
        manager: Arc<QueueManager>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (outcomes, _) = broadcast::channel(256);
        let poll_interval = manager.settings().poll_interval();
        let lease = manager.settings().lease();

        let mut handles = Vec::with_capacity(concurrency + 1);
        for worker_index in 0..concurrency {
            handles.push(tokio::spawn(executor_loop(
                queue,
                worker_index,
                manager.clone(),
                handler.clone(),
                manager.settings().channel_recheck_secs,
                poll_interval,
                lease,
                shutdown.subscribe(),
                outcomes.clone(),
            )));
        }
        handles.push(tokio::spawn(maintenance_loop(
            queue,
            manager,
            shutdown.subscribe(),
        )));

        tracing::info!(queue = %queue, concurrency, "Worker pool started");
        Self {
            queue,
            shutdown,
            outcomes,
            handles,
        }
    }

    /// Subscribe to job outcome events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
        self.outcomes.subscribe()
    }

    /// Signal shutdown and wait for in-flight jobs to finish.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!(queue = %self.queue, "Worker pool closed");
    }
}

#[allow(clippy::too_many_arguments)]
async fn executor_loop(
    queue: QueueName,
    worker_index: usize,
    manager: Arc<QueueManager>,
    handler: Arc<dyn JobHandler>,
    channel_recheck_secs: u64,
    poll_interval: Duration,
    lease: Duration,
    mut shutdown: watch::Receiver<bool>,
    outcomes: broadcast::Sender<JobOutcome>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match manager.lease_next(queue).await {
            Ok(Some(job)) => {
                process_job(
                    &manager,
                    handler.as_ref(),
                    job,
                    channel_recheck_secs,
                    lease,
                    &outcomes,
                )
                .await;
            }
            Ok(None) => {
                tokio::select! {
                    () = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(err) => {
                tracing::error!(queue = %queue, worker = worker_index, error = %err, "Job lease failed");
                tokio::select! {
                    () = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

async fn process_job(
    manager: &Arc<QueueManager>,
    handler: &dyn JobHandler,
    job: Job,
    channel_recheck_secs: u64,
    lease: Duration,
    outcomes: &broadcast::Sender<JobOutcome>,
) {
    let tenant_id = job.payload.tenant_id().to_string();
    let job_id = job.id.clone();
    let queue = job.queue;
    let attempts = job.attempts;

    // Keep the lease alive while the handler runs; a crashed worker stops
    // renewing and the job becomes re-deliverable after the lease expires.
    let renewal = {
        let manager = manager.clone();
        let job = job.clone();
        tokio::spawn(async move {
            let cadence = (lease / 2).max(Duration::from_millis(250));
            let mut interval = tokio::time::interval(cadence);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(err) = manager.renew_lease(&job).await {
                    tracing::warn!(job_id = %job.id, error = %err, "Lease renewal failed");
                }
            }
        })
    };

    let result = handler.handle(&job).await;
    renewal.abort();

    let outcome = match result {
        Ok(()) => match manager.complete(job).await {
            Ok(()) => Some(OutcomeKind::Completed),
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "Failed to record job completion");
                None
            }
        },
        Err(handler_err) => {
            let kind = match &handler_err {
                JobError::Retryable(_) => FailureKind::Retry,
                JobError::Fatal(_) => FailureKind::Fatal,
                JobError::ChannelUnavailable { wait: true, .. } => {
                    FailureKind::RetryAfter(Duration::from_secs(channel_recheck_secs))
                }
                // Failing fast: no point burning the retry budget against a
                // channel that is not coming back this minute.
                JobError::ChannelUnavailable { .. } => FailureKind::Fatal,
            };
            let error = handler_err.to_string();
            match manager.fail(job, &error, kind).await {
                Ok(FailDisposition::Rescheduled { delay_ms }) => {
                    Some(OutcomeKind::Rescheduled { delay_ms })
                }
                Ok(FailDisposition::DeadLettered) => Some(OutcomeKind::DeadLettered { error }),
                Err(err) => {
                    tracing::error!(job_id = %job_id, error = %err, "Failed to record job failure");
                    None
                }
            }
        }
    };

    if let Some(result) = outcome {
        // Nobody listening is fine; outcomes are best-effort telemetry.
        let _ = outcomes.send(JobOutcome {
            job_id,
            queue,
            tenant_id,
            attempts,
            result,
        });
    }
}

async fn maintenance_loop(
    queue: QueueName,
    manager: Arc<QueueManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        if let Err(err) = manager.promote_due(queue).await {
            tracing::error!(queue = %queue, error = %err, "Failed to promote delayed jobs");
        }
        match manager.reap_stalled(queue).await {
            Ok(reaped) if reaped > 0 => {
                tracing::warn!(queue = %queue, reaped, "Re-delivered stalled jobs");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(queue = %queue, error = %err, "Failed to reap stalled jobs");
            }
        }
    }
}
