//! Scheduler counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::backend::TaskReport;
use crate::error::TaskError;

/// Point-in-time view of the scheduler counters.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Tasks whose pipeline is executing right now.
    pub running: u64,
    /// Tasks whose pipeline returned a result.
    pub completed: u64,
    /// Tasks that ended with a handler error, a panic, or no pipeline.
    pub failed: u64,
    /// Tasks whose deadline passed.
    pub timed_out: u64,
    /// Tasks canceled before or during processing.
    pub canceled: u64,
    /// Subset of `failed` caused by a panicking stage.
    pub panicked: u64,
    /// Mean pop-to-report time over every reported task.
    pub average_duration: Duration,
}

impl SchedulerStats {
    /// Returns the number of tasks reported so far.
    pub fn total_processed(&self) -> u64 {
        self.completed + self.failed + self.timed_out + self.canceled
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.completed as f64 / total as f64) * 100.0
    }
}

#[derive(Debug, Default)]
pub(crate) struct SharedStats {
    running: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    canceled: AtomicU64,
    panicked: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedStats {
    pub(crate) fn task_started(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn task_stopped(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn record(&self, report: &TaskReport) {
        let counter = match &report.outcome {
            Ok(_) => &self.completed,
            Err(TaskError::Canceled) => &self.canceled,
            Err(TaskError::DeadlineExceeded) => &self.timed_out,
            Err(TaskError::Unexpected { .. }) => {
                self.panicked.fetch_add(1, Ordering::SeqCst);
                &self.failed
            }
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(report.duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            running: self.running.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            timed_out: self.timed_out.load(Ordering::SeqCst),
            canceled: self.canceled.load(Ordering::SeqCst),
            panicked: self.panicked.load(Ordering::SeqCst),
            average_duration: Duration::ZERO,
        };

        let total = stats.total_processed();
        if total > 0 {
            let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
            stats.average_duration = Duration::from_millis(total_duration_ms / total);
        }
        stats
    }
}
