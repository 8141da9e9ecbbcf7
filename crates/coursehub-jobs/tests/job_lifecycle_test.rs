use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coursehub_jobs::{
    Backoff, CoordinatorConfig, InMemoryBackend, Job, JobClient, JobContext, JobCoordinator,
    JobError, JobEvent, JobSettings, JobStatus, JobType, Result, SubmitOptions, WorkerConfig,
    WorkerPool,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmailJobData {
    to: String,
    subject: String,
}

#[derive(Clone)]
struct EmailJob {
    calls: Arc<AtomicU32>,
    fail_first: u32,
    ran_at: Arc<Mutex<Vec<DateTime<Utc>>>>,
}

impl EmailJob {
    fn failing_first(n: u32) -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            fail_first: n,
            ran_at: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Job for EmailJob {
    const TYPE: JobType = JobType::Email;
    type Data = EmailJobData;

    async fn execute(&self, ctx: JobContext, data: Self::Data) -> Result<serde_json::Value> {
        self.ran_at.lock().unwrap().push(Utc::now());
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            return Err(JobError::processing(format!("mail server refused {}", data.to)));
        }
        ctx.update_progress(100).await?;
        Ok(serde_json::json!({ "delivered_to": data.to, "attempt": ctx.attempt }))
    }
}

struct Harness {
    client: JobClient,
    pool: WorkerPool,
}

async fn harness(job: EmailJob) -> Harness {
    let backend = Arc::new(InMemoryBackend::new());
    let coordinator = Arc::new(JobCoordinator::new(backend.clone()));
    coordinator
        .initialize(CoordinatorConfig {
            defaults: JobSettings {
                backoff: Backoff::Fixed { delay_ms: 10 },
                ..JobSettings::default()
            },
            ..CoordinatorConfig::default()
        })
        .await
        .expect("initialize failed");

    let pool = WorkerPool::builder(
        backend,
        WorkerConfig {
            queues: vec![JobType::Email],
            poll_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        },
    )
    .register(job)
    .close_backend_on_shutdown(false)
    .build()
    .expect("worker pool failed to build");
    pool.start().await.expect("worker pool failed to start");

    Harness {
        client: JobClient::new(coordinator),
        pool,
    }
}

fn email(to: &str) -> serde_json::Value {
    serde_json::to_value(EmailJobData {
        to: to.to_string(),
        subject: "Your course starts tomorrow".to_string(),
    })
    .unwrap()
}

/// Forward every event of `job_id` into a channel
fn watch(client: &JobClient, job_id: &str) -> mpsc::UnboundedReceiver<JobEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.subscribe(job_id, move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

async fn until_settled(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(
                event,
                JobEvent::Completed { .. }
                    | JobEvent::Failed {
                        will_retry: false,
                        ..
                    }
            );
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    })
    .await
    .expect("job did not settle in time")
}

#[tokio::test]
async fn test_job_succeeds_on_third_attempt() {
    let job = EmailJob::failing_first(2);
    let h = harness(job.clone()).await;

    let id = "enrollment-mail-1";
    let mut events = watch(&h.client, id);
    h.client
        .submit(
            JobType::Email,
            SubmitOptions::new(email("ada@example.com"))
                .job_id(id)
                .attempts(3)
                .remove_on_complete(false),
        )
        .await
        .unwrap();

    let seen = until_settled(&mut events).await;
    let failures = seen
        .iter()
        .filter(|e| matches!(e, JobEvent::Failed { will_retry: true, .. }))
        .count();
    assert_eq!(failures, 2);

    let status = h.client.get_status(id).await.unwrap();
    assert_eq!(status.state, JobStatus::Completed);
    assert_eq!(status.attempts_made, 3);
    assert_eq!(status.progress, 100);
    assert_eq!(
        h.client.get_result(id).await.unwrap(),
        Some(serde_json::json!({ "delivered_to": "ada@example.com", "attempt": 3 }))
    );
    assert_eq!(job.calls.load(Ordering::SeqCst), 3);

    assert!(h.pool.shutdown(Duration::from_secs(1)).await.is_drained());
}

#[tokio::test]
async fn test_job_fails_after_max_attempts() {
    let job = EmailJob::failing_first(u32::MAX);
    let h = harness(job.clone()).await;

    let id = "enrollment-mail-2";
    let mut events = watch(&h.client, id);
    h.client
        .submit(
            JobType::Email,
            SubmitOptions::new(email("grace@example.com"))
                .job_id(id)
                .attempts(3),
        )
        .await
        .unwrap();
    until_settled(&mut events).await;

    let status = h.client.get_status(id).await.unwrap();
    assert_eq!(status.state, JobStatus::Failed);
    assert_eq!(status.attempts_made, 3);
    assert_eq!(
        status.failed_reason.as_deref(),
        Some("Processing error: mail server refused grace@example.com")
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(job.calls.load(Ordering::SeqCst), 3);
    h.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_delayed_job_waits_for_its_delay() {
    let job = EmailJob::failing_first(0);
    let h = harness(job.clone()).await;

    let id = "reminder-1";
    let mut events = watch(&h.client, id);
    h.client
        .submit(
            JobType::Email,
            SubmitOptions::new(email("linus@example.com"))
                .job_id(id)
                .delay(Duration::from_millis(200))
                .remove_on_complete(false),
        )
        .await
        .unwrap();
    let submitted = h.client.coordinator().find_job(id).await.unwrap().unwrap();
    assert_eq!(submitted.status, JobStatus::Delayed);

    let seen = until_settled(&mut events).await;
    assert_eq!(seen.first().map(|e| e.name()), Some("delayed"));

    let ran_at = job.ran_at.lock().unwrap()[0];
    assert!(ran_at >= submitted.created_at + chrono::Duration::milliseconds(200));
    h.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_removed_waiting_job_is_not_found() {
    let h = harness(EmailJob::failing_first(0)).await;
    h.client
        .coordinator()
        .pause_queue(JobType::Email)
        .await
        .unwrap();

    let id = h
        .client
        .submit(JobType::Email, SubmitOptions::new(email("barbara@example.com")))
        .await
        .unwrap();
    assert_eq!(h.client.get_status(&id).await.unwrap().state, JobStatus::Waiting);

    h.client.cancel(&id).await.unwrap();
    assert!(matches!(
        h.client.get_status(&id).await,
        Err(JobError::JobNotFound(_))
    ));
    h.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_paused_queue_keeps_jobs_until_resumed() {
    let job = EmailJob::failing_first(0);
    let h = harness(job.clone()).await;
    let coordinator = h.client.coordinator().clone();
    coordinator.pause_queue(JobType::Email).await.unwrap();

    let id = "digest-1";
    let mut events = watch(&h.client, id);
    h.client
        .submit(
            JobType::Email,
            SubmitOptions::new(email("ken@example.com")).job_id(id),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(job.calls.load(Ordering::SeqCst), 0);
    let metrics = coordinator.metrics().await.unwrap();
    assert_eq!(metrics.queues[&JobType::Email].waiting, 1);
    assert!(metrics.queues[&JobType::Email].paused);

    coordinator.resume_queue(JobType::Email).await.unwrap();
    until_settled(&mut events).await;
    assert_eq!(job.calls.load(Ordering::SeqCst), 1);
    h.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shutdown_rejects_new_jobs() {
    let h = harness(EmailJob::failing_first(0)).await;
    h.client.coordinator().shutdown().await.unwrap();

    let result = h
        .client
        .submit(JobType::Email, SubmitOptions::new(email("dennis@example.com")))
        .await;
    assert!(matches!(result, Err(JobError::ShuttingDown)));

    let batch = h
        .client
        .submit_batch(vec![
            (JobType::Email, SubmitOptions::new(email("a@example.com"))),
            (JobType::Email, SubmitOptions::new(email("b@example.com"))),
        ])
        .await;
    assert!(batch.iter().all(|r| matches!(r, Err(JobError::ShuttingDown))));
    h.pool.shutdown(Duration::from_secs(1)).await;
}
