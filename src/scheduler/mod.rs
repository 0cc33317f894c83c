//! Task scheduling: pipelines, task lifecycle and the dispatch loops.
//!
//! - **Pipeline**: ordered named stages registered per task type
//! - **Task**: a popped unit of work with an atomic status and a cancel handle
//! - **Scheduler**: pop loop, bounded wait buffer, dispatch loop, one worker per task
//!
//! # Architecture
//!
//! ```text
//!    ┌──────────────┐   push    ┌──────────────┐
//!    │   Producer   │──────────▶│   Backend    │
//!    └──────────────┘           │ (Redis/mem)  │
//!                               └──────┬───────┘
//!                                      │ pop
//!                               ┌──────▼───────┐
//!                               │   Pop loop   │── registry insert
//!                               └──────┬───────┘
//!                                      │
//!                               ┌──────▼───────┐
//!                               │ Wait buffer  │ (bounded)
//!                               └──────┬───────┘
//!                                      │
//!                               ┌──────▼───────┐
//!                               │Dispatch loop │
//!                               └──────┬───────┘
//!          ┌───────────────────────────┼───────────────────────────┐
//!          ▼                           ▼                           ▼
//!     ┌─────────┐                 ┌─────────┐                 ┌─────────┐
//!     │ Worker  │ stage > stage   │ Worker  │                 │ Worker  │
//!     └────┬────┘                 └────┬────┘                 └────┬────┘
//!          └──────────── report_result + registry remove ──────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskflow::backend::MemoryBackend;
//! use taskflow::config::SchedulerConfig;
//! use taskflow::scheduler::{Scheduler, StageInput};
//! use tokio_util::sync::CancellationToken;
//!
//! let scheduler = Arc::new(Scheduler::new(
//!     SchedulerConfig::default(),
//!     Arc::new(MemoryBackend::new()),
//! ));
//!
//! scheduler
//!     .register("resize", "load", |_ctx, task, _input| async move {
//!         Ok(task.data().clone())
//!     })
//!     .append("shrink", |_ctx, _task, input: StageInput| async move {
//!         Ok(input.into_value().unwrap_or_default())
//!     });
//!
//! let shutdown = CancellationToken::new();
//! let running = tokio::spawn(Arc::clone(&scheduler).run(shutdown.clone()));
//!
//! let id = scheduler.push("resize", serde_json::json!({"w": 64}), None).await?;
//!
//! shutdown.cancel();
//! running.await??;
//! ```
//!
//! # Cancellation
//!
//! - Canceling the scheduler's base token cancels every task context
//! - A task timeout cancels that task's context when it passes
//! - [`Task::cancel`] cancels the context of a running task, or stops a
//!   waiting task from ever starting
//!
//! Cancellation is cooperative: stages observe it through [`TaskContext`],
//! and the pipeline checks it between stages.

pub mod context;
pub mod dispatcher;
pub mod pipeline;
mod registry;
pub mod stats;
pub mod task;

// Re-export main types for convenience
pub use context::TaskContext;
pub use dispatcher::Scheduler;
pub use pipeline::{Pipeline, PipelineHandle, Pipelines, Stage, StageHandler, StageInput};
pub use stats::SchedulerStats;
pub use task::{Task, TaskStatus};
