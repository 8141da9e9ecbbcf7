//! Environment-driven configuration.
//!
//! Every field of [`JobsConfig`] reads from a `JOBS_`-prefixed variable
//! (`redis_url` from `JOBS_REDIS_URL` and so on) after a `.env` file in the
//! working directory, if any, has been loaded. Unset variables keep their
//! defaults.
//!
//! ```ignore
//! use coursehub_jobs::JobsConfig;
//!
//! let config = JobsConfig::from_env()?;
//! let worker = config.worker_config()?;
//! ```

use crate::coordinator::CoordinatorConfig;
use crate::error::{JobError, Result};
use crate::job::{JobSettings, JobType};
use crate::worker::WorkerConfig;
use serde::Deserialize;
use std::time::Duration;

/// Prefix of every variable read by [`JobsConfig::from_env`]
pub const ENV_PREFIX: &str = "JOBS";

const SECS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Namespace for every backend key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Comma-separated queue names served by this process; empty means all
    #[serde(default)]
    pub queues: String,
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,
    #[serde(default = "default_thirty_secs")]
    pub stalled_check_interval_secs: u64,
    #[serde(default = "default_thirty_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_thirty_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_autoscale_interval_secs")]
    pub autoscale_interval_secs: u64,
    #[serde(default = "default_cleanup_retention_days")]
    pub cleanup_retention_days: u64,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    #[serde(default = "default_recovery_alert_threshold")]
    pub recovery_alert_threshold: u32,
    /// Pause the served queues when this process shuts down. Off by
    /// default: the pause is stored in the backend and would hold back
    /// other workers and the next start until someone resumes the queues.
    #[serde(default)]
    pub pause_on_shutdown: bool,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "coursehub".to_string()
}

fn default_min_concurrency() -> usize {
    1
}

fn default_max_concurrency() -> usize {
    10
}

fn default_concurrency() -> usize {
    2
}

fn default_lock_duration_secs() -> u64 {
    30
}

fn default_thirty_secs() -> u64 {
    30
}

fn default_autoscale_interval_secs() -> u64 {
    60
}

fn default_cleanup_retention_days() -> u64 {
    7
}

fn default_maintenance_interval_secs() -> u64 {
    SECS_PER_DAY
}

fn default_recovery_alert_threshold() -> u32 {
    5
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            queues: String::new(),
            min_concurrency: default_min_concurrency(),
            max_concurrency: default_max_concurrency(),
            concurrency: default_concurrency(),
            lock_duration_secs: default_lock_duration_secs(),
            stalled_check_interval_secs: default_thirty_secs(),
            shutdown_timeout_secs: default_thirty_secs(),
            health_check_interval_secs: default_thirty_secs(),
            autoscale_interval_secs: default_autoscale_interval_secs(),
            cleanup_retention_days: default_cleanup_retention_days(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            recovery_alert_threshold: default_recovery_alert_threshold(),
            pause_on_shutdown: false,
        }
    }
}

/// Load variables from `.env` in the working directory, if present.
/// Variables already set in the environment win.
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}

impl JobsConfig {
    /// Load `.env`, then read `JOBS_*` variables
    pub fn from_env() -> Result<Self> {
        load_dotenv();
        Self::from_env_prefixed(ENV_PREFIX)
    }

    /// Read `{prefix}_*` variables without touching `.env`
    pub fn from_env_prefixed(prefix: &str) -> Result<Self> {
        let config: Self = envy::prefixed(format!("{}_", prefix))
            .from_env()
            .map_err(|e| JobError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_concurrency == 0 {
            return Err(JobError::Config("min_concurrency must be at least 1".to_string()));
        }
        if self.min_concurrency > self.max_concurrency {
            return Err(JobError::Config(format!(
                "min_concurrency ({}) exceeds max_concurrency ({})",
                self.min_concurrency, self.max_concurrency
            )));
        }
        for (name, value) in [
            ("lock_duration_secs", self.lock_duration_secs),
            ("stalled_check_interval_secs", self.stalled_check_interval_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("autoscale_interval_secs", self.autoscale_interval_secs),
            ("maintenance_interval_secs", self.maintenance_interval_secs),
        ] {
            if value == 0 {
                return Err(JobError::Config(format!("{} must be greater than zero", name)));
            }
        }
        self.served_queues().map(|_| ())
    }

    /// Queues named in `queues`, or every job type if it is empty
    pub fn served_queues(&self) -> Result<Vec<JobType>> {
        let names: Vec<&str> = self
            .queues
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if names.is_empty() {
            return Ok(JobType::ALL.to_vec());
        }

        let mut queues = Vec::with_capacity(names.len());
        for name in names {
            let job_type = name.parse::<JobType>().map_err(JobError::Config)?;
            if !queues.contains(&job_type) {
                queues.push(job_type);
            }
        }
        Ok(queues)
    }

    /// Worker settings; the starting concurrency is clamped into range
    pub fn worker_config(&self) -> Result<WorkerConfig> {
        Ok(WorkerConfig {
            queues: self.served_queues()?,
            min_concurrency: self.min_concurrency,
            max_concurrency: self.max_concurrency,
            concurrency: self
                .concurrency
                .clamp(self.min_concurrency, self.max_concurrency),
            lock_duration: Duration::from_secs(self.lock_duration_secs),
            stalled_check_interval: Duration::from_secs(self.stalled_check_interval_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            autoscale_interval: Duration::from_secs(self.autoscale_interval_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            recovery_alert_threshold: self.recovery_alert_threshold,
            ..WorkerConfig::default()
        })
    }

    pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        Ok(CoordinatorConfig {
            queues: self.served_queues()?,
            defaults: JobSettings::default(),
            maintenance_interval: Duration::from_secs(self.maintenance_interval_secs),
            cleanup_retention: Duration::from_secs(self.cleanup_retention_days * SECS_PER_DAY),
            pause_on_shutdown: self.pause_on_shutdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 5] = [
        "JOBSTEST_REDIS_URL",
        "JOBSTEST_QUEUES",
        "JOBSTEST_MIN_CONCURRENCY",
        "JOBSTEST_MAX_CONCURRENCY",
        "JOBSTEST_CONCURRENCY",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_when_unset() {
        clear();
        let config = JobsConfig::from_env_prefixed("JOBSTEST").unwrap();
        assert_eq!(config, JobsConfig::default());
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.served_queues().unwrap(), JobType::ALL.to_vec());
    }

    #[test]
    #[serial]
    fn variables_override_defaults() {
        clear();
        std::env::set_var("JOBSTEST_REDIS_URL", "redis://queue:6380/2");
        std::env::set_var("JOBSTEST_QUEUES", "email, report");
        std::env::set_var("JOBSTEST_MAX_CONCURRENCY", "4");
        std::env::set_var("JOBSTEST_CONCURRENCY", "8");

        let config = JobsConfig::from_env_prefixed("JOBSTEST").unwrap();
        clear();

        assert_eq!(config.redis_url, "redis://queue:6380/2");
        assert_eq!(
            config.served_queues().unwrap(),
            vec![JobType::Email, JobType::Report]
        );
        let worker = config.worker_config().unwrap();
        assert_eq!(worker.max_concurrency, 4);
        assert_eq!(worker.concurrency, 4);
    }

    #[test]
    #[serial]
    fn inverted_bounds_are_rejected() {
        clear();
        std::env::set_var("JOBSTEST_MIN_CONCURRENCY", "6");
        std::env::set_var("JOBSTEST_MAX_CONCURRENCY", "3");
        let result = JobsConfig::from_env_prefixed("JOBSTEST");
        clear();
        assert!(matches!(result, Err(JobError::Config(_))));
    }

    #[test]
    #[serial]
    fn unparseable_numbers_are_config_errors() {
        clear();
        std::env::set_var("JOBSTEST_MAX_CONCURRENCY", "lots");
        let result = JobsConfig::from_env_prefixed("JOBSTEST");
        clear();
        assert!(matches!(result, Err(JobError::Config(_))));
    }

    #[test]
    fn unknown_queue_name_is_rejected() {
        let config = JobsConfig {
            queues: "email,video".to_string(),
            ..JobsConfig::default()
        };
        assert!(matches!(config.validate(), Err(JobError::Config(_))));
    }

    #[test]
    fn coordinator_config_uses_retention_days() {
        let config = JobsConfig {
            cleanup_retention_days: 2,
            ..JobsConfig::default()
        };
        let coordinator = config.coordinator_config().unwrap();
        assert_eq!(coordinator.cleanup_retention, Duration::from_secs(2 * 86_400));
        assert_eq!(coordinator.maintenance_interval, Duration::from_secs(86_400));
        assert!(!coordinator.pause_on_shutdown);
    }
}
