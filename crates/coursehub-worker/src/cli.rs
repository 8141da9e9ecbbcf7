//! CLI argument parsing

use clap::Parser;
use coursehub_jobs::JobsConfig;

/// CourseHub worker - serves background job queues until interrupted
#[derive(Parser, Debug)]
#[command(name = "coursehub-worker")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Comma-separated queues to serve (overrides JOBS_QUEUES)
    #[arg(short, long)]
    pub queues: Option<String>,

    /// Redis connection URL (overrides JOBS_REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Starting concurrency (overrides JOBS_CONCURRENCY)
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

impl Cli {
    /// Apply command line overrides on top of the environment config
    pub fn apply(&self, config: &mut JobsConfig) {
        if let Some(queues) = &self.queues {
            config.queues = queues.clone();
        }
        if let Some(url) = &self.redis_url {
            config.redis_url = url.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
    }
}
