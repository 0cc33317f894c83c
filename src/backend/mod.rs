//! Pluggable task storage.
//!
//! A [`Backend`] is the durable side of the scheduler: producers push task
//! envelopes into it, the scheduler's pop loop drains it, and every popped
//! task ends with exactly one [`TaskReport`] written back through
//! [`Backend::report_result`].
//!
//! Two implementations ship with the crate:
//!
//! - [`RedisBackend`]: sorted-set priority queue driven by Lua scripts
//! - [`MemoryBackend`]: process-local queue, used by tests and embedders
//!   that do not need durability

pub mod memory;
pub mod redis_store;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::TaskError;

pub use self::memory::MemoryBackend;
pub use self::redis_store::RedisBackend;

/// Errors that can occur during backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No task is available. Not a failure; the pop loop backs off.
    #[error("queue is empty")]
    Empty,

    /// The task id is unknown or no longer queued.
    #[error("task {0} not found")]
    NotFound(String),

    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to (de)serialize a stored record.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored record is missing fields or malformed.
    #[error("corrupt record for task {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Serialized body of a queued task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Pipeline selector.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Producer-defined payload.
    pub data: Value,
    /// Run timeout in milliseconds, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl TaskEnvelope {
    pub fn new(task_type: impl Into<String>, data: Value, timeout: Option<Duration>) -> Self {
        Self {
            task_type: task_type.into(),
            data,
            timeout_ms: timeout
                .filter(|t| !t.is_zero())
                .map(|t| t.as_millis() as u64),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// A task handed out by [`Backend::pop_task`].
#[derive(Debug, Clone, PartialEq)]
pub struct PoppedTask {
    pub id: String,
    pub task_type: String,
    pub data: Value,
    pub timeout: Option<Duration>,
}

impl PoppedTask {
    pub fn from_envelope(id: impl Into<String>, envelope: TaskEnvelope) -> Self {
        let timeout = envelope.timeout();
        Self {
            id: id.into(),
            task_type: envelope.task_type,
            data: envelope.data,
            timeout,
        }
    }
}

/// Terminal state recorded for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// The pipeline returned a result.
    Completed,
    /// A stage returned an error or panicked.
    Failed,
    /// The task deadline passed.
    Timeout,
    /// The task was canceled.
    Canceled,
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportStatus::Completed => write!(f, "completed"),
            ReportStatus::Failed => write!(f, "failed"),
            ReportStatus::Timeout => write!(f, "timeout"),
            ReportStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for ReportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(ReportStatus::Completed),
            "failed" => Ok(ReportStatus::Failed),
            "timeout" => Ok(ReportStatus::Timeout),
            "canceled" => Ok(ReportStatus::Canceled),
            other => Err(format!("unknown report status '{}'", other)),
        }
    }
}

/// Outcome of one task run, passed to [`Backend::report_result`].
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub id: String,
    pub task_type: String,
    /// Time from pop to completion.
    pub duration: Duration,
    pub outcome: Result<Value, TaskError>,
}

impl TaskReport {
    pub fn status(&self) -> ReportStatus {
        match &self.outcome {
            Ok(_) => ReportStatus::Completed,
            Err(TaskError::Canceled) => ReportStatus::Canceled,
            Err(TaskError::DeadlineExceeded) => ReportStatus::Timeout,
            Err(_) => ReportStatus::Failed,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.outcome.as_ref().err()
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Flattens the report into the storable record form.
    pub fn to_record(&self) -> ResultRecord {
        ResultRecord {
            id: self.id.clone(),
            task_type: self.task_type.clone(),
            status: self.status(),
            error: self.error().map(|e| e.to_string()),
            result: self.result().cloned(),
            duration_ms: self.duration.as_millis() as u64,
            finished_at: Utc::now(),
        }
    }
}

/// Stored, serializable form of a [`TaskReport`], readable by external collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: String,
    pub task_type: String,
    pub status: ReportStatus,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Durable queue and result sink used by the scheduler.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Liveness probe. The scheduler refuses to start when this fails.
    async fn ping(&self) -> Result<(), BackendError>;

    /// Enqueues a task and returns its id. Lower `priority` pops first.
    async fn push_task(&self, envelope: TaskEnvelope, priority: i64)
        -> Result<String, BackendError>;

    /// Dequeues one task, or returns [`BackendError::Empty`] without blocking.
    async fn pop_task(&self) -> Result<PoppedTask, BackendError>;

    /// Removes a task that is still queued. Returns [`BackendError::NotFound`]
    /// when the id is not in the queue.
    async fn cancel_task(&self, id: &str) -> Result<(), BackendError>;

    /// Records the outcome of a popped task.
    async fn report_result(&self, report: TaskReport) -> Result<(), BackendError>;

    /// Reads back a recorded outcome.
    async fn get_result(&self, id: &str) -> Result<Option<ResultRecord>, BackendError>;
}
