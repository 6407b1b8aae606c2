//! Priority job queue for courier-rs.
//!
//! This crate provides asynchronous job processing over the shared cache:
//!
//! - **Jobs**: Tagged payloads per queue (message, automation, campaign)
//! - **Manager**: Named priority queues with retry, backoff and retention
//! - **Workers**: Bounded per-queue pools leasing one job at a time
//! - **Dead letter**: Terminal holding queue for exhausted jobs
//! - **Scheduler**: Cron-driven recurring job submission
//!
//! Priority is lower-is-first: a priority 1 job is served before a
//! priority 5 job. Jobs of equal priority are served FIFO by ready time.

pub mod job;
pub mod jobs;
pub mod manager;
pub mod scheduler;
pub mod workers;

pub use job::{BackoffPolicy, Job, JobError, JobRef, JobState};
pub use jobs::{
    AutomationJob, AutomationKind, CampaignJob, DeadLetterJob, JobPayload, MessageJob,
};
pub use manager::{EnqueueOpts, FailDisposition, FailureKind, QueueCounts, QueueManager, QueueName};
pub use scheduler::RecurringScheduler;
pub use workers::{
    AutomationHandler, CampaignHandler, JobHandler, JobOutcome, MessageHandler, MessageResponder,
    OutcomeKind, WorkerPool,
};
