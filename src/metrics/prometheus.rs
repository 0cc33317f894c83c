//! Prometheus collectors for the scheduler.
//!
//! Collectors are owned by a [`SchedulerMetrics`] value and registered in a
//! caller-supplied [`Registry`], so several schedulers (or tests) never share
//! counters by accident.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::backend::ReportStatus;

/// Scheduler collectors.
#[derive(Clone)]
pub struct SchedulerMetrics {
    registry: Registry,
    tasks_total: IntCounterVec,
    task_duration: HistogramVec,
    tasks_running: IntGauge,
    wait_buffer_depth: IntGauge,
}

impl SchedulerMetrics {
    /// Creates collectors in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Creates collectors and registers them in `registry`.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if a collector with the same name is
    /// already registered.
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let tasks_total = IntCounterVec::new(
            Opts::new("taskflow_tasks_total", "Tasks finished, by type and final status"),
            &["task_type", "status"],
        )?;

        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "taskflow_task_duration_seconds",
                "Time from pop to report, in seconds",
            )
            .buckets(vec![0.005, 0.05, 0.25, 1.0, 5.0, 30.0, 120.0, 600.0]),
            &["task_type"],
        )?;

        let tasks_running = IntGauge::new(
            "taskflow_tasks_running",
            "Tasks whose pipeline is currently executing",
        )?;

        let wait_buffer_depth = IntGauge::new(
            "taskflow_wait_buffer_depth",
            "Popped tasks waiting for dispatch",
        )?;

        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(tasks_running.clone()))?;
        registry.register(Box::new(wait_buffer_depth.clone()))?;

        Ok(Self {
            registry,
            tasks_total,
            task_duration,
            tasks_running,
            wait_buffer_depth,
        })
    }

    pub fn record_finished(&self, task_type: &str, status: ReportStatus, duration: Duration) {
        self.tasks_total
            .with_label_values(&[task_type, &status.to_string()])
            .inc();
        self.task_duration
            .with_label_values(&[task_type])
            .observe(duration.as_secs_f64());
    }

    pub fn task_started(&self) {
        self.tasks_running.inc();
    }

    pub fn task_stopped(&self) {
        self.tasks_running.dec();
    }

    pub fn set_wait_buffer_depth(&self, depth: usize) {
        self.wait_buffer_depth.set(depth as i64);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders every collector in the registry in Prometheus text format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_recorded_series() {
        let metrics = SchedulerMetrics::new().expect("metrics should register");
        metrics.record_finished("echo", ReportStatus::Completed, Duration::from_millis(20));
        metrics.record_finished("echo", ReportStatus::Failed, Duration::from_millis(5));
        metrics.task_started();
        metrics.set_wait_buffer_depth(3);

        let completed = metrics
            .tasks_total
            .with_label_values(&["echo", "completed"])
            .get();
        assert_eq!(completed, 1);
        assert_eq!(
            metrics.task_duration.with_label_values(&["echo"]).get_sample_count(),
            2
        );

        let text = metrics.export();
        assert!(text.contains("taskflow_tasks_total"));
        assert!(text.contains(r#"status="failed""#));
        assert!(text.contains("taskflow_tasks_running 1"));
        assert!(text.contains("taskflow_wait_buffer_depth 3"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        SchedulerMetrics::with_registry(registry.clone()).expect("first registration");
        assert!(SchedulerMetrics::with_registry(registry).is_err());
    }

    #[test]
    fn test_running_gauge_goes_down() {
        let metrics = SchedulerMetrics::new().expect("metrics should register");
        metrics.task_started();
        metrics.task_started();
        metrics.task_stopped();

        assert!(metrics.export().contains("taskflow_tasks_running 1"));
    }
}
