//! Error types shared across the scheduler.
//!
//! - `TaskError`: terminal outcome of a single task run, handed to the backend
//! - `SchedulerError`: errors returned by the producer/operator API

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;

/// Why a task run did not produce a result.
///
/// Cloneable so the same error can be recorded on the task and reported to
/// the backend.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task was canceled before or during processing.
    #[error("task canceled")]
    Canceled,

    /// The task context deadline passed.
    #[error("task deadline exceeded")]
    DeadlineExceeded,

    /// A stage handler returned an error.
    #[error("{0}")]
    Handler(Arc<anyhow::Error>),

    /// A stage handler panicked. `path` is the stage path at the time of the panic.
    #[error("unexpected error at [{}]: {message}", .path.join(" > "))]
    Unexpected { message: String, path: Vec<String> },

    /// No pipeline is registered in this process for the popped task's type.
    #[error("no pipeline registered for task type '{0}'")]
    NoPipeline(String),
}

impl TaskError {
    /// Builds a handler error from a plain message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::Handler(Arc::new(anyhow::Error::msg(message)))
    }

    /// Returns true for `Canceled` and `DeadlineExceeded`.
    pub fn is_context_error(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }

    /// Returns the underlying handler error, if this is one.
    pub fn as_handler(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Handler(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::Handler(Arc::new(err))
    }
}

/// Errors returned by [`Scheduler`](crate::scheduler::Scheduler) operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The backend did not answer the startup ping.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[source] BackendError),

    /// No pipeline is registered for the pushed task type.
    #[error("unknown task type '{0}'")]
    UnknownTaskType(String),

    /// The scheduler loops are already running.
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// The scheduler configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The task already finished and is only waiting to be reported.
    #[error("task '{0}' already finished")]
    TaskFinished(String),

    /// A backend call failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}
