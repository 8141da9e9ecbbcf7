use crate::job::{JobStatus, JobType};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job coordinator is not initialized")]
    NotInitialized,

    #[error("No queue registered for job type: {0}")]
    QueueNotFound(JobType),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {id} is {status}, operation not allowed")]
    InvalidState { id: String, status: JobStatus },

    #[error("Job {id} is no longer held by this worker")]
    LockMismatch { id: String },

    #[error("Queue is shutting down")]
    ShuttingDown,

    #[error("No processor registered for job type: {0}")]
    NoProcessor(JobType),

    #[error("Missing processors for job types: {0:?}")]
    MissingProcessors(Vec<JobType>),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Graceful shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Invalid schedule expression: {0}")]
    InvalidSchedule(String),

    #[error("Job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl JobError {
    /// Create a processing error from anything displayable
    pub fn processing(msg: impl Into<String>) -> Self {
        Self::Processing(msg.into())
    }

    /// Whether another attempt could possibly succeed.
    ///
    /// A missing processor or an undecodable payload fails the same way on
    /// every attempt, so those go straight to `failed`.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::NoProcessor(_) | Self::MissingProcessors(_) | Self::Serialization(_)
        )
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for JobError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
