//! Queue integration tests.
//!
//! Drive real worker pools against the in-memory cache backend and scripted
//! handlers, and verify the retry, dead-letter and outcome-event contracts
//! end to end.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_cache::{CircuitBreaker, GuardedCache, MemoryBackend};
use courier_common::config::{BreakerSettings, QueueSettings};
use courier_queue::{
    EnqueueOpts, Job, JobError, JobHandler, JobPayload, JobState, MessageJob, OutcomeKind,
    QueueManager, QueueName, WorkerPool,
};

/// Handler that fails a scripted number of times before succeeding.
struct FlakyHandler {
    calls: AtomicU32,
    failures_before_success: u32,
    fatal: bool,
}

impl FlakyHandler {
    fn failing(failures_before_success: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures_before_success,
            fatal: false,
        }
    }

    fn fatal() -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures_before_success: u32::MAX,
            fatal: true,
        }
    }
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn handle(&self, _job: &Job) -> Result<(), JobError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            return Err(JobError::Fatal("session revoked".into()));
        }
        if call < self.failures_before_success {
            Err(JobError::Retryable("provider timeout".into()))
        } else {
            Ok(())
        }
    }
}

fn fast_settings() -> QueueSettings {
    let mut settings = QueueSettings::default();
    // Millisecond backoff and polling so retries complete within the test.
    settings.messages.backoff_base_ms = 10;
    settings.messages.max_attempts = 3;
    settings.poll_interval_ms = 20;
    settings
}

fn manager_with(settings: QueueSettings) -> Arc<QueueManager> {
    let cache = GuardedCache::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(CircuitBreaker::new("cache", BreakerSettings::default())),
    );
    Arc::new(QueueManager::new(cache, settings))
}

fn message_payload(message_id: &str) -> JobPayload {
    JobPayload::Message(MessageJob {
        tenant_id: "t1".into(),
        channel_id: "c1".into(),
        from: "5511999@provider".into(),
        content: "hello".into(),
        message_id: message_id.to_string(),
        push_name: Some("Alice".into()),
    })
}

/// Poll until the job reaches a terminal state or the deadline passes.
async fn wait_for_state(
    manager: &QueueManager,
    queue: QueueName,
    id: &str,
    state: JobState,
    deadline: Duration,
) -> Job {
    let started = tokio::time::Instant::now();
    loop {
        if let Some(job) = manager.get_job(queue, id).await.unwrap() {
            if job.state == state {
                return job;
            }
        }
        assert!(
            started.elapsed() < deadline,
            "job {id} did not reach {state:?} within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_job_completes_after_two_failures() {
    let manager = manager_with(fast_settings());
    let handler = Arc::new(FlakyHandler::failing(2));
    let pool = WorkerPool::start(QueueName::Messages, manager.clone(), handler.clone(), 2);

    let job_ref = manager
        .enqueue(
            QueueName::Messages,
            message_payload("m1"),
            EnqueueOpts {
                job_id: Some("m1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Fails twice, succeeds on the third attempt.
    let job = wait_for_state(
        &manager,
        QueueName::Messages,
        &job_ref.id,
        JobState::Completed,
        Duration::from_secs(10),
    )
    .await;

    assert_eq!(job.attempts, 3);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    // No dead-letter entry for a job that eventually succeeded.
    assert_eq!(
        manager.counts(QueueName::DeadLetter).await.unwrap().waiting,
        0
    );

    pool.close().await;
}

#[tokio::test]
async fn test_exhausted_retries_land_in_dead_letter_queue() {
    let manager = manager_with(fast_settings());
    let pool = WorkerPool::start(
        QueueName::Messages,
        manager.clone(),
        Arc::new(FlakyHandler::failing(u32::MAX)),
        1,
    );

    manager
        .enqueue(
            QueueName::Messages,
            message_payload("m1"),
            EnqueueOpts {
                job_id: Some("m1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = wait_for_state(
        &manager,
        QueueName::Messages,
        "m1",
        JobState::Failed,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(job.attempts, 3);

    // Exactly one dead-letter entry, original payload intact.
    let counts = manager.counts(QueueName::DeadLetter).await.unwrap();
    assert_eq!(counts.waiting, 1);
    let entry = manager
        .get_job(QueueName::DeadLetter, "dlq-messages-m1")
        .await
        .unwrap()
        .unwrap();
    let JobPayload::DeadLetter(dead) = &entry.payload else {
        panic!("expected dead-letter payload");
    };
    assert_eq!(dead.origin_queue, "messages");
    assert_eq!(dead.payload["content"], "hello");
    assert_eq!(dead.payload["pushName"], "Alice");

    pool.close().await;
}

#[tokio::test]
async fn test_fatal_error_skips_retries() {
    let manager = manager_with(fast_settings());
    let handler = Arc::new(FlakyHandler::fatal());
    let pool = WorkerPool::start(QueueName::Messages, manager.clone(), handler.clone(), 1);

    manager
        .enqueue(
            QueueName::Messages,
            message_payload("m1"),
            EnqueueOpts {
                job_id: Some("m1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = wait_for_state(
        &manager,
        QueueName::Messages,
        "m1",
        JobState::Failed,
        Duration::from_secs(10),
    )
    .await;

    // One attempt, straight to the dead-letter queue.
    assert_eq!(job.attempts, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.counts(QueueName::DeadLetter).await.unwrap().waiting,
        1
    );

    pool.close().await;
}

#[tokio::test]
async fn test_outcome_events_are_emitted() {
    let manager = manager_with(fast_settings());
    let pool = WorkerPool::start(
        QueueName::Messages,
        manager.clone(),
        Arc::new(FlakyHandler::failing(1)),
        1,
    );
    let mut outcomes = pool.subscribe();

    manager
        .enqueue(
            QueueName::Messages,
            message_payload("m1"),
            EnqueueOpts {
                job_id: Some("m1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // First event: rescheduled after the scripted failure.
    let first = tokio::time::timeout(Duration::from_secs(10), outcomes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.job_id, "m1");
    assert_eq!(first.tenant_id, "t1");
    assert!(matches!(first.result, OutcomeKind::Rescheduled { .. }));

    // Second event: completed.
    let second = tokio::time::timeout(Duration::from_secs(10), outcomes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(second.result, OutcomeKind::Completed));
    assert_eq!(second.attempts, 2);

    pool.close().await;
}

#[tokio::test]
async fn test_concurrent_workers_never_double_process() {
    let manager = manager_with(fast_settings());
    let handler = Arc::new(FlakyHandler::failing(0));
    let pool = WorkerPool::start(QueueName::Messages, manager.clone(), handler.clone(), 4);

    for i in 0..20 {
        manager
            .enqueue(
                QueueName::Messages,
                message_payload(&format!("m{i}")),
                EnqueueOpts {
                    job_id: Some(format!("m{i}")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    for i in 0..20 {
        wait_for_state(
            &manager,
            QueueName::Messages,
            &format!("m{i}"),
            JobState::Completed,
            Duration::from_secs(10),
        )
        .await;
    }

    // Four contending workers, each job handled exactly once.
    assert_eq!(handler.calls.load(Ordering::SeqCst), 20);

    pool.close().await;
}
