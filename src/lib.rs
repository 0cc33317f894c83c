//! taskflow: a pipeline task scheduler over a Redis priority queue.
//!
//! Producers push typed tasks into a [`Backend`](backend::Backend); a
//! [`Scheduler`](scheduler::Scheduler) pops them into a bounded wait buffer
//! and runs each one through the stage pipeline registered for its type,
//! reporting the outcome back to the backend.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used types
pub use backend::{Backend, BackendError, MemoryBackend, RedisBackend};
pub use config::{ConfigError, RedisConfig, SchedulerConfig};
pub use error::{SchedulerError, TaskError};
pub use scheduler::{Scheduler, StageInput, Task, TaskContext, TaskStatus};
