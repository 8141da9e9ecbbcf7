//! Processors for every CourseHub job type.
//!
//! The heavy lifting (transcoding, mail delivery, push delivery) belongs to
//! other services; these processors validate the payload, drive those steps
//! and report progress so the job record reflects where the work is.

use async_trait::async_trait;
use coursehub_jobs::{Job, JobContext, JobCoordinator, JobError, JobType, Result, WorkerPoolBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::Instrument;

/// Register one processor per job type
pub fn register_all(
    builder: WorkerPoolBuilder,
    coordinator: Arc<JobCoordinator>,
) -> WorkerPoolBuilder {
    builder
        .register(ContentProcessingJob)
        .register(EmailJob)
        .register(NotificationJob)
        .register(ReportJob {
            coordinator: coordinator.clone(),
        })
        .register(CleanupJob { coordinator })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentProcessingData {
    pub content_id: String,
    pub course_id: String,
    /// Renditions to produce, e.g. `["720p", "1080p"]`
    #[serde(default)]
    pub renditions: Vec<String>,
}

pub struct ContentProcessingJob;

#[async_trait]
impl Job for ContentProcessingJob {
    const TYPE: JobType = JobType::ContentProcessing;
    type Data = ContentProcessingData;

    async fn execute(&self, ctx: JobContext, data: Self::Data) -> Result<serde_json::Value> {
        let span = ctx.span().clone();
        async move {
            if data.content_id.is_empty() {
                return Err(JobError::processing("content_id is empty"));
            }
            let renditions = if data.renditions.is_empty() {
                vec!["source".to_string()]
            } else {
                data.renditions.clone()
            };

            let total = renditions.len();
            for (done, rendition) in renditions.iter().enumerate() {
                tracing::info!(
                    content_id = %data.content_id,
                    rendition = %rendition,
                    "Processing rendition"
                );
                let percent = ((done + 1) * 100 / total) as u8;
                ctx.update_progress(percent).await?;
            }

            Ok(serde_json::json!({
                "content_id": data.content_id,
                "course_id": data.course_id,
                "renditions": renditions,
            }))
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailData {
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub template: Option<String>,
}

pub struct EmailJob;

#[async_trait]
impl Job for EmailJob {
    const TYPE: JobType = JobType::Email;
    type Data = EmailData;

    async fn execute(&self, ctx: JobContext, data: Self::Data) -> Result<serde_json::Value> {
        if !data.to.contains('@') {
            return Err(JobError::processing(format!(
                "invalid recipient address: {}",
                data.to
            )));
        }
        let template = data.template.as_deref().unwrap_or("plain");
        tracing::info!(
            parent: ctx.span(),
            to = %data.to,
            subject = %data.subject,
            template,
            "Email handed to mailer"
        );
        Ok(serde_json::json!({ "to": data.to, "template": template }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Push,
    InApp,
    Sms,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationData {
    pub user_ids: Vec<String>,
    pub message: String,
    pub channel: Channel,
}

pub struct NotificationJob;

#[async_trait]
impl Job for NotificationJob {
    const TYPE: JobType = JobType::Notification;
    type Data = NotificationData;

    async fn execute(&self, ctx: JobContext, data: Self::Data) -> Result<serde_json::Value> {
        let span = ctx.span().clone();
        async move {
            let total = data.user_ids.len();
            for (sent, user_id) in data.user_ids.iter().enumerate() {
                tracing::debug!(user_id = %user_id, channel = ?data.channel, "Notification sent");
                if total > 0 {
                    ctx.update_progress(((sent + 1) * 100 / total) as u8).await?;
                }
            }
            tracing::info!(recipients = total, channel = ?data.channel, "Notifications delivered");
            Ok(serde_json::json!({ "recipients": total }))
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportData {
    /// Free-form report name echoed in the result
    pub name: String,
}

/// Snapshot of queue health across the platform
pub struct ReportJob {
    coordinator: Arc<JobCoordinator>,
}

#[async_trait]
impl Job for ReportJob {
    const TYPE: JobType = JobType::Report;
    type Data = ReportData;

    async fn execute(&self, ctx: JobContext, data: Self::Data) -> Result<serde_json::Value> {
        let metrics = self.coordinator.metrics().await?;
        ctx.update_progress(100).await?;
        tracing::info!(
            parent: ctx.span(),
            report = %data.name,
            waiting = metrics.totals.waiting,
            failed = metrics.totals.failed,
            "Queue report generated"
        );
        Ok(serde_json::json!({
            "name": data.name,
            "metrics": metrics,
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupData {
    pub retention_days: u32,
}

/// Removes finished job records past their retention
pub struct CleanupJob {
    coordinator: Arc<JobCoordinator>,
}

#[async_trait]
impl Job for CleanupJob {
    const TYPE: JobType = JobType::Cleanup;
    type Data = CleanupData;

    async fn execute(&self, ctx: JobContext, data: Self::Data) -> Result<serde_json::Value> {
        let removed = self.coordinator.cleanup_old_jobs(data.retention_days).await?;
        tracing::info!(
            parent: ctx.span(),
            removed,
            retention_days = data.retention_days,
            "Old jobs cleaned up"
        );
        Ok(serde_json::json!({ "removed": removed }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursehub_jobs::{
        CoordinatorConfig, InMemoryBackend, JobOptions, JobStatus, WorkerConfig, WorkerPool,
    };
    use std::time::Duration;

    async fn run_one(job_type: JobType, payload: serde_json::Value) -> coursehub_jobs::JobRecord {
        let backend = Arc::new(InMemoryBackend::new());
        let coordinator = Arc::new(JobCoordinator::new(backend.clone()));
        coordinator
            .initialize(CoordinatorConfig::default())
            .await
            .unwrap();

        let pool = register_all(
            WorkerPool::builder(
                backend,
                WorkerConfig {
                    poll_interval: Duration::from_millis(5),
                    ..WorkerConfig::default()
                },
            ),
            coordinator.clone(),
        )
        .close_backend_on_shutdown(false)
        .build()
        .unwrap();
        pool.start().await.unwrap();

        let id = coordinator
            .create_job(
                job_type,
                payload,
                JobOptions::new().attempts(1).remove_on_complete(false),
            )
            .await
            .unwrap()
            .id;

        let record = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let record = coordinator.find_job(&id).await.unwrap().unwrap();
                if record.status.is_finished() {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not finish");

        pool.shutdown(Duration::from_secs(1)).await;
        coordinator.shutdown().await.unwrap();
        record
    }

    #[tokio::test]
    async fn content_processing_reports_full_progress() {
        let record = run_one(
            JobType::ContentProcessing,
            serde_json::json!({
                "content_id": "lesson-4",
                "course_id": "rust-101",
                "renditions": ["480p", "720p", "1080p"],
            }),
        )
        .await;
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress, 100);
    }

    #[tokio::test]
    async fn email_to_invalid_address_fails() {
        let record = run_one(
            JobType::Email,
            serde_json::json!({ "to": "not-an-address", "subject": "Welcome" }),
        )
        .await;
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(
            record.failed_reason.as_deref(),
            Some("Processing error: invalid recipient address: not-an-address")
        );
    }

    #[tokio::test]
    async fn cleanup_reports_removed_count() {
        let record = run_one(JobType::Cleanup, serde_json::json!({ "retention_days": 7 })).await;
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.result, Some(serde_json::json!({ "removed": 0 })));
    }
}
