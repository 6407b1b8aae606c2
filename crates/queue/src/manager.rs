//! Priority queue manager over the shared cache.
//!
//! Three business queues plus a distinguished dead-letter queue, tuned from
//! configuration. Storage layout per queue, all under the `jobs:` key space:
//!
//! - `jobs:{queue}:job:{id}` - serialized [`Job`] record
//! - `jobs:{queue}:ready` - sorted set scored by priority band + ready time
//! - `jobs:{queue}:delayed` - sorted set scored by ready time
//! - `jobs:{queue}:active` - sorted set scored by lease deadline
//! - `jobs:{queue}:completed` / `jobs:{queue}:failed` - terminal sets scored
//!   by finish time, pruned by retention
//!
//! A worker claims a job by winning the `zrem` on the ready set; the cache's
//! single-key atomicity is the only locking involved.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_cache::GuardedCache;
use courier_common::config::{QueueSettings, QueueTuning, Retention};
use courier_common::{AppError, AppResult, IdGenerator};
use serde::{Deserialize, Serialize};

use crate::job::{BackoffPolicy, Job, JobRef, JobState};
use crate::jobs::{DeadLetterJob, JobPayload};

/// Priority band width in the ready-set score: `priority * BAND + ready_ms`.
/// Wide enough that ready times (epoch milliseconds) never cross bands, and
/// small enough that `255 * BAND + ready_ms` stays exactly representable in
/// an f64 mantissa.
const PRIORITY_BAND: f64 = 1e13;

/// How many candidates to fetch per claim round; contending workers skip
/// members another worker already removed.
const CLAIM_BATCH: usize = 8;

/// Upper bound on members touched by one maintenance or cleanup call.
const SWEEP_BATCH: usize = 256;

/// The fixed set of queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    /// Inbound real-time messages. Priority 1 (highest).
    Messages,
    /// Scheduled automations. Priority 3.
    Automations,
    /// Bulk campaigns. Priority 5 (lowest).
    Campaigns,
    /// Terminal holding queue for exhausted jobs. No automatic retry.
    DeadLetter,
}

impl QueueName {
    /// The three business queues, in priority order.
    pub const BUSINESS: [Self; 3] = [Self::Messages, Self::Automations, Self::Campaigns];

    /// Queue name as stored in cache keys and the API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Automations => "automations",
            Self::Campaigns => "campaigns",
            Self::DeadLetter => "dead-letter",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "messages" => Ok(Self::Messages),
            "automations" => Ok(Self::Automations),
            "campaigns" => Ok(Self::Campaigns),
            "dead-letter" => Ok(Self::DeadLetter),
            other => Err(AppError::UnknownQueue(other.to_string())),
        }
    }
}

/// Options for a single enqueue call.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOpts {
    /// Override the queue's default priority. Lower values are served first.
    pub priority: Option<u8>,
    /// Delay before the job becomes deliverable.
    pub delay: Option<Duration>,
    /// Caller-supplied id. Resubmitting with the same id returns the
    /// existing job instead of creating a second record.
    pub job_id: Option<String>,
}

/// Waiting/delayed/active/completed/failed snapshot for one queue.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    /// Jobs ready for delivery.
    pub waiting: u64,
    /// Jobs waiting out a delay or backoff.
    pub delayed: u64,
    /// Jobs currently leased.
    pub active: u64,
    /// Completed jobs retained for inspection.
    pub completed: u64,
    /// Failed jobs retained for diagnostics.
    pub failed: u64,
}

/// How a handler failure should be recorded.
#[derive(Debug, Clone, Copy)]
pub enum FailureKind {
    /// Retry with the job's backoff policy.
    Retry,
    /// Retry after a specific delay (delayed channel re-check).
    RetryAfter(Duration),
    /// Do not retry; dead-letter immediately.
    Fatal,
}

/// What happened to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Rescheduled with a delay.
    Rescheduled {
        /// Delay until the next attempt, in milliseconds.
        delay_ms: u64,
    },
    /// Moved to the dead-letter queue.
    DeadLettered,
}

/// Manager for the fixed queue set.
///
/// Jobs are durably recorded in the cache before `enqueue` returns; a cache
/// outage surfaces to the caller as a retryable error rather than silently
/// dropping work.
pub struct QueueManager {
    cache: GuardedCache,
    settings: QueueSettings,
    closed: AtomicBool,
}

impl QueueManager {
    /// Create a manager over a breaker-guarded cache.
    #[must_use]
    pub fn new(cache: GuardedCache, settings: QueueSettings) -> Self {
        tracing::info!("Queue manager initialized with 3 priority queues");
        Self {
            cache,
            settings,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue tuning from configuration.
    #[must_use]
    pub fn tuning(&self, queue: QueueName) -> Option<&QueueTuning> {
        match queue {
            QueueName::Messages => Some(&self.settings.messages),
            QueueName::Automations => Some(&self.settings.automations),
            QueueName::Campaigns => Some(&self.settings.campaigns),
            QueueName::DeadLetter => None,
        }
    }

    /// Queue-level settings shared by the worker pools.
    #[must_use]
    pub const fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    // === Producer surface ===

    /// Submit a job. Returns a reference once the job is durably recorded.
    ///
    /// Never blocks on worker availability. With a caller-supplied
    /// `job_id`, resubmission is idempotent: the existing job is returned
    /// and no second record is created.
    pub async fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        opts: EnqueueOpts,
    ) -> AppResult<JobRef> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::Queue("queue manager is closed".into()));
        }
        let Some(tuning) = self.tuning(queue) else {
            return Err(AppError::BadRequest(
                "jobs cannot be submitted directly to the dead-letter queue".into(),
            ));
        };

        let now = Utc::now();
        let id = opts.job_id.unwrap_or_else(|| {
            IdGenerator::job_id(queue.as_str(), payload.tenant_id(), now.timestamp_millis())
        });

        if let Some(existing) = self.load_job(queue, &id).await? {
            tracing::debug!(job_id = %id, queue = %queue, "Duplicate submission, returning existing job");
            return Ok(JobRef { id: existing.id, queue });
        }

        let delay = opts.delay.unwrap_or(Duration::ZERO);
        let ready_at = now
            + chrono::Duration::from_std(delay)
                .map_err(|e| AppError::BadRequest(format!("delay out of range: {e}")))?;
        let job = Job {
            id: id.clone(),
            queue,
            priority: opts.priority.unwrap_or(tuning.priority),
            payload,
            attempts: 0,
            max_attempts: tuning.max_attempts,
            backoff: BackoffPolicy::Exponential {
                base_delay_ms: tuning.backoff_base_ms,
            },
            state: JobState::Waiting,
            stalled_count: 0,
            enqueued_at: now,
            ready_at,
            lease_expires_at: None,
            last_error: None,
        };

        self.save_job(&job).await?;
        if delay.is_zero() {
            self.cache
                .zadd(&Self::ready_key(queue), ready_score(job.priority, ready_at), &id)
                .await?;
        } else {
            self.cache
                .zadd(&Self::delayed_key(queue), millis(ready_at), &id)
                .await?;
        }

        tracing::info!(
            job_id = %id,
            queue = %queue,
            priority = job.priority,
            delay_ms = delay.as_millis() as u64,
            "Job enqueued"
        );
        Ok(JobRef { id, queue })
    }

    // === Worker surface ===

    /// Lease the next ready job, if any. Priority order, FIFO among equal
    /// priority and ready time. Increments `attempts` and moves the job to
    /// `Active` with a lease deadline.
    pub async fn lease_next(&self, queue: QueueName) -> AppResult<Option<Job>> {
        let ready_key = Self::ready_key(queue);

        loop {
            let candidates = self.cache.zrange_by_score(&ready_key, f64::MAX, CLAIM_BATCH).await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            for (id, _) in candidates {
                // Winning the removal is the claim.
                if !self.cache.zrem(&ready_key, &id).await? {
                    continue;
                }

                let Some(mut job) = self.load_job(queue, &id).await? else {
                    tracing::warn!(job_id = %id, queue = %queue, "Ready entry without job record, dropping");
                    continue;
                };

                let now = Utc::now();
                let deadline = now
                    + chrono::Duration::from_std(self.settings.lease())
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                job.attempts += 1;
                job.state = JobState::Active;
                job.lease_expires_at = Some(deadline);
                self.save_job(&job).await?;
                self.cache
                    .zadd(&Self::active_key(queue), millis(deadline), &id)
                    .await?;

                return Ok(Some(job));
            }
        }
    }

    /// Extend a leased job's deadline.
    pub async fn renew_lease(&self, job: &Job) -> AppResult<()> {
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.settings.lease())
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        self.cache
            .zadd(&Self::active_key(job.queue), millis(deadline), &job.id)
            .await?;
        Ok(())
    }

    /// Mark a leased job completed.
    pub async fn complete(&self, mut job: Job) -> AppResult<()> {
        self.cache.zrem(&Self::active_key(job.queue), &job.id).await?;

        let now = Utc::now();
        job.state = JobState::Completed;
        job.lease_expires_at = None;
        self.save_job(&job).await?;
        self.cache
            .zadd(&Self::completed_key(job.queue), millis(now), &job.id)
            .await?;

        tracing::info!(job_id = %job.id, queue = %job.queue, attempts = job.attempts, "Job completed");

        if let Some(tuning) = self.tuning(job.queue) {
            let retention = tuning.completed;
            self.enforce_retention(job.queue, &Self::completed_key(job.queue), retention)
                .await?;
        }
        Ok(())
    }

    /// Record a handler failure for a leased job.
    ///
    /// Retryable failures below the attempt budget are rescheduled with
    /// backoff; everything else moves the job, payload intact, to the
    /// dead-letter queue.
    pub async fn fail(
        &self,
        mut job: Job,
        error: &str,
        kind: FailureKind,
    ) -> AppResult<FailDisposition> {
        self.cache.zrem(&Self::active_key(job.queue), &job.id).await?;
        job.last_error = Some(error.to_string());
        job.lease_expires_at = None;

        let exhausted = job.attempts >= job.max_attempts;
        if matches!(kind, FailureKind::Fatal) || exhausted {
            self.dead_letter(job, error).await?;
            return Ok(FailDisposition::DeadLettered);
        }

        let delay = match kind {
            FailureKind::RetryAfter(delay) => delay,
            _ => job.backoff.delay_for_attempt(job.attempts),
        };
        let ready_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(2));
        job.state = JobState::DelayedRetry;
        job.ready_at = ready_at;
        self.save_job(&job).await?;
        self.cache
            .zadd(&Self::delayed_key(job.queue), millis(ready_at), &job.id)
            .await?;

        tracing::warn!(
            job_id = %job.id,
            queue = %job.queue,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error,
            "Job failed, rescheduled with backoff"
        );
        Ok(FailDisposition::Rescheduled {
            delay_ms: delay.as_millis() as u64,
        })
    }

    /// Move delayed jobs whose ready time has arrived into the ready set.
    /// Retried jobs re-enter ordering at their new ready time.
    pub async fn promote_due(&self, queue: QueueName) -> AppResult<u64> {
        let delayed_key = Self::delayed_key(queue);
        let now = millis(Utc::now());

        let due = self.cache.zrange_by_score(&delayed_key, now, SWEEP_BATCH).await?;
        let mut promoted = 0;
        for (id, ready_ms) in due {
            if !self.cache.zrem(&delayed_key, &id).await? {
                continue;
            }
            let Some(mut job) = self.load_job(queue, &id).await? else {
                continue;
            };
            job.state = JobState::Waiting;
            self.save_job(&job).await?;
            self.cache
                .zadd(&Self::ready_key(queue), job.priority as f64 * PRIORITY_BAND + ready_ms, &id)
                .await?;
            promoted += 1;
        }

        if promoted > 0 {
            tracing::debug!(queue = %queue, promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    /// Re-deliver jobs whose lease expired. A job may stall at most
    /// `max_stalled` times before it is dead-lettered, bounding duplicate
    /// side effects from crashed workers.
    pub async fn reap_stalled(&self, queue: QueueName) -> AppResult<u64> {
        let active_key = Self::active_key(queue);
        let now = Utc::now();

        let expired = self
            .cache
            .zrange_by_score(&active_key, millis(now), SWEEP_BATCH)
            .await?;
        let mut reaped = 0;
        for (id, _) in expired {
            if !self.cache.zrem(&active_key, &id).await? {
                continue;
            }
            let Some(mut job) = self.load_job(queue, &id).await? else {
                continue;
            };

            job.stalled_count += 1;
            job.lease_expires_at = None;
            if job.stalled_count > self.settings.max_stalled || job.attempts >= job.max_attempts {
                tracing::error!(
                    job_id = %job.id,
                    queue = %queue,
                    stalled_count = job.stalled_count,
                    "Job stalled past the re-delivery limit"
                );
                self.dead_letter(job, "job stalled more than allowable limit").await?;
            } else {
                tracing::warn!(
                    job_id = %job.id,
                    queue = %queue,
                    stalled_count = job.stalled_count,
                    "Lease expired, job re-delivered"
                );
                job.state = JobState::Waiting;
                job.ready_at = now;
                self.save_job(&job).await?;
                self.cache
                    .zadd(&Self::ready_key(queue), ready_score(job.priority, now), &id)
                    .await?;
            }
            reaped += 1;
        }
        Ok(reaped)
    }

    // === Operational surface ===

    /// Load a job by id.
    pub async fn get_job(&self, queue: QueueName, id: &str) -> AppResult<Option<Job>> {
        self.load_job(queue, id).await
    }

    /// Waiting/delayed/active/completed/failed counts for one queue.
    pub async fn counts(&self, queue: QueueName) -> AppResult<QueueCounts> {
        Ok(QueueCounts {
            waiting: self.cache.zcard(&Self::ready_key(queue)).await?,
            delayed: self.cache.zcard(&Self::delayed_key(queue)).await?,
            active: self.cache.zcard(&Self::active_key(queue)).await?,
            completed: self.cache.zcard(&Self::completed_key(queue)).await?,
            failed: self.cache.zcard(&Self::failed_key(queue)).await?,
        })
    }

    /// Prune terminal jobs older than the cutoff from every business queue.
    /// Dead-letter entries are kept; they are the diagnostic record.
    pub async fn clean(&self, older_than: Duration) -> AppResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| AppError::BadRequest(format!("cutoff out of range: {e}")))?;

        let mut removed = 0;
        for queue in QueueName::BUSINESS {
            for key in [Self::completed_key(queue), Self::failed_key(queue)] {
                removed += self.prune_terminal(queue, &key, millis(cutoff), usize::MAX).await?;
            }
        }

        tracing::info!(removed, "Old jobs cleaned");
        Ok(removed)
    }

    /// Requeue every failed job in a queue for another round of attempts.
    pub async fn retry_all_failed(&self, queue: QueueName) -> AppResult<u64> {
        let failed_key = Self::failed_key(queue);
        let mut retried = 0;

        loop {
            let failed = self.cache.zrange_by_score(&failed_key, f64::MAX, SWEEP_BATCH).await?;
            if failed.is_empty() {
                break;
            }
            for (id, _) in failed {
                if !self.cache.zrem(&failed_key, &id).await? {
                    continue;
                }
                let Some(mut job) = self.load_job(queue, &id).await? else {
                    continue;
                };
                let now = Utc::now();
                job.attempts = 0;
                job.stalled_count = 0;
                job.state = JobState::Waiting;
                job.ready_at = now;
                self.save_job(&job).await?;
                self.cache
                    .zadd(&Self::ready_key(queue), ready_score(job.priority, now), &id)
                    .await?;
                retried += 1;
            }
        }

        tracing::info!(queue = %queue, count = retried, "Failed jobs retried");
        Ok(retried)
    }

    /// Stop accepting work. In-flight leases drain through the worker pools.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        tracing::info!("Queue manager closed");
    }

    // === Internals ===

    /// Terminal-failure path: mark the origin record `Failed` and create the
    /// dead-letter entry. The entry id is derived from the origin, so a job
    /// appears in the dead-letter queue exactly once.
    async fn dead_letter(&self, mut job: Job, error: &str) -> AppResult<()> {
        let now = Utc::now();
        let origin_queue = job.queue;

        job.state = JobState::Failed;
        job.last_error = Some(error.to_string());
        self.save_job(&job).await?;
        self.cache
            .zadd(&Self::failed_key(origin_queue), millis(now), &job.id)
            .await?;
        if let Some(tuning) = self.tuning(origin_queue) {
            let retention = tuning.failed;
            self.enforce_retention(origin_queue, &Self::failed_key(origin_queue), retention)
                .await?;
        }

        let dlq_id = format!("dlq-{}-{}", origin_queue, job.id);
        if self.load_job(QueueName::DeadLetter, &dlq_id).await?.is_some() {
            return Ok(());
        }

        let entry = Job {
            id: dlq_id.clone(),
            queue: QueueName::DeadLetter,
            priority: 0,
            payload: JobPayload::DeadLetter(DeadLetterJob {
                origin_queue: origin_queue.as_str().to_string(),
                origin_job_id: job.id.clone(),
                tenant_id: job.payload.tenant_id().to_string(),
                payload: serde_json::to_value(&job.payload)?,
                error: error.to_string(),
                failed_at: now,
            }),
            attempts: 0,
            max_attempts: 1,
            backoff: BackoffPolicy::Fixed { base_delay_ms: 0 },
            state: JobState::Waiting,
            stalled_count: 0,
            enqueued_at: now,
            ready_at: now,
            lease_expires_at: None,
            last_error: None,
        };
        self.save_job(&entry).await?;
        self.cache
            .zadd(&Self::ready_key(QueueName::DeadLetter), millis(now), &dlq_id)
            .await?;

        tracing::error!(
            job_id = %job.id,
            queue = %origin_queue,
            attempts = job.attempts,
            error,
            "Job moved to dead-letter queue"
        );
        Ok(())
    }

    /// Apply a retention rule to a terminal set: age cutoff first, then the
    /// count cap, whichever constraint binds.
    async fn enforce_retention(
        &self,
        queue: QueueName,
        key: &str,
        retention: Retention,
    ) -> AppResult<()> {
        let age_cutoff = Utc::now()
            - chrono::Duration::from_std(retention.max_age())
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        self.prune_terminal(queue, key, millis(age_cutoff), usize::MAX).await?;

        let total = self.cache.zcard(key).await?;
        if total > retention.count {
            let excess = (total - retention.count) as usize;
            self.prune_terminal(queue, key, f64::MAX, excess).await?;
        }
        Ok(())
    }

    /// Remove up to `limit` oldest members below `max_score` from a terminal
    /// set, deleting their job records.
    async fn prune_terminal(
        &self,
        queue: QueueName,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> AppResult<u64> {
        let mut removed = 0;
        while (removed as usize) < limit {
            let batch = SWEEP_BATCH.min(limit - removed as usize);
            let members = self.cache.zrange_by_score(key, max_score, batch).await?;
            if members.is_empty() {
                break;
            }
            for (id, _) in members {
                if self.cache.zrem(key, &id).await? {
                    self.cache.del(&Self::job_key(queue, &id)).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn load_job(&self, queue: QueueName, id: &str) -> AppResult<Option<Job>> {
        let Some(raw) = self.cache.get(&Self::job_key(queue, id)).await? else {
            return Ok(None);
        };
        let job = serde_json::from_str(&raw)
            .map_err(|e| AppError::Queue(format!("corrupt job record {id}: {e}")))?;
        Ok(Some(job))
    }

    async fn save_job(&self, job: &Job) -> AppResult<()> {
        let raw = serde_json::to_string(job)?;
        self.cache
            .set(&Self::job_key(job.queue, &job.id), &raw, None)
            .await?;
        Ok(())
    }

    fn job_key(queue: QueueName, id: &str) -> String {
        format!("jobs:{queue}:job:{id}")
    }

    fn ready_key(queue: QueueName) -> String {
        format!("jobs:{queue}:ready")
    }

    fn delayed_key(queue: QueueName) -> String {
        format!("jobs:{queue}:delayed")
    }

    fn active_key(queue: QueueName) -> String {
        format!("jobs:{queue}:active")
    }

    fn completed_key(queue: QueueName) -> String {
        format!("jobs:{queue}:completed")
    }

    fn failed_key(queue: QueueName) -> String {
        format!("jobs:{queue}:failed")
    }
}

fn millis(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

fn ready_score(priority: u8, ready_at: DateTime<Utc>) -> f64 {
    priority as f64 * PRIORITY_BAND + millis(ready_at)
}
