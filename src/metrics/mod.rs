//! Prometheus metrics for the scheduler.
//!
//! # Example
//!
//! ```ignore
//! use taskflow::metrics::SchedulerMetrics;
//!
//! let metrics = SchedulerMetrics::new()?;
//! let scheduler = Scheduler::new(config, backend).with_metrics(metrics.clone());
//!
//! // Serve this from a /metrics endpoint
//! let text = metrics.export();
//! ```

pub mod prometheus;

pub use self::prometheus::SchedulerMetrics;
