use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of a worker pool's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerMetrics {
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub total_processing_time: Duration,
    /// Waiting jobs across the served queues at the last auto-scaling tick
    pub last_queue_depth: u64,
    pub concurrency: usize,
    pub in_flight: usize,
    pub recoveries: u64,
    pub consecutive_recovery_failures: u32,
}

impl WorkerMetrics {
    pub fn average_processing_time(&self) -> Option<Duration> {
        let runs = self.jobs_processed + self.jobs_failed;
        if runs == 0 {
            return None;
        }
        Some(self.total_processing_time / runs as u32)
    }
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    processed: AtomicU64,
    failed: AtomicU64,
    processing_micros: AtomicU64,
    queue_depth: AtomicU64,
    recoveries: AtomicU64,
    recovery_failures: AtomicU32,
}

impl MetricsRecorder {
    pub(crate) fn record_success(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.add_time(elapsed);
    }

    pub(crate) fn record_failure(&self, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.add_time(elapsed);
    }

    fn add_time(&self, elapsed: Duration) {
        self.processing_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub(crate) fn recovery_succeeded(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        self.recovery_failures.store(0, Ordering::Relaxed);
    }

    /// Returns the number of consecutive failures including this one
    pub(crate) fn recovery_failed(&self) -> u32 {
        self.recovery_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_recovery_failures(&self) {
        self.recovery_failures.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, concurrency: usize, in_flight: usize) -> WorkerMetrics {
        WorkerMetrics {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            total_processing_time: Duration::from_micros(
                self.processing_micros.load(Ordering::Relaxed),
            ),
            last_queue_depth: self.queue_depth.load(Ordering::Relaxed),
            concurrency,
            in_flight,
            recoveries: self.recoveries.load(Ordering::Relaxed),
            consecutive_recovery_failures: self.recovery_failures.load(Ordering::Relaxed),
        }
    }
}
