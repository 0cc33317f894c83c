//! Task state and lifecycle.
//!
//! Status moves `Init -> Running -> Done`, `Init -> Running -> Canceled`, or
//! `Init -> Canceled`. `Done` and `Canceled` are terminal.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::registry::TaskRegistry;
use crate::backend::PoppedTask;
use crate::error::TaskError;

/// Lifecycle status of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Popped and waiting in the wait buffer.
    Init = 0,
    /// A worker is driving the pipeline.
    Running = 1,
    /// Canceled before or during processing.
    Canceled = 2,
    /// The pipeline returned, successfully or not.
    Done = 3,
}

impl TaskStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskStatus::Init,
            1 => TaskStatus::Running,
            2 => TaskStatus::Canceled,
            _ => TaskStatus::Done,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Canceled | TaskStatus::Done)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Init => write!(f, "init"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Canceled => write!(f, "canceled"),
            TaskStatus::Done => write!(f, "done"),
        }
    }
}

/// A popped unit of work.
///
/// Tasks are only created by the scheduler's pop loop and shared as
/// `Arc<Task>` between the registry, the wait buffer and the worker.
pub struct Task {
    id: String,
    task_type: String,
    data: Value,
    timeout: Option<Duration>,
    created_at: Instant,
    status: AtomicU8,
    path: Mutex<Vec<String>>,
    cancel: OnceLock<CancellationToken>,
    cancel_flag: AtomicBool,
    error: Mutex<Option<TaskError>>,
    registry: Weak<TaskRegistry>,
}

impl Task {
    pub(crate) fn new(popped: PoppedTask, registry: Weak<TaskRegistry>) -> Self {
        Self {
            id: popped.id,
            task_type: popped.task_type,
            data: popped.data,
            timeout: popped.timeout,
            created_at: Instant::now(),
            status: AtomicU8::new(TaskStatus::Init as u8),
            path: Mutex::new(Vec::new()),
            cancel: OnceLock::new(),
            cancel_flag: AtomicBool::new(false),
            error: Mutex::new(None),
            registry,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Producer payload, passed through untouched.
    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Time since the task was popped.
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Snapshot of the stage names visited so far, in order.
    pub fn path(&self) -> Vec<String> {
        self.path.lock().expect("lock not poisoned").clone()
    }

    /// The last error recorded for this task.
    pub fn err(&self) -> Option<TaskError> {
        self.error.lock().expect("lock not poisoned").clone()
    }

    /// Cancels the task.
    ///
    /// No-op once the task is `Done` or already `Canceled`. Otherwise the
    /// task becomes `Canceled`, leaves the running registry, and its run
    /// context (if armed) is canceled. Safe to call concurrently.
    pub fn cancel(&self) {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if TaskStatus::from_u8(current).is_terminal() {
                return;
            }
            match self.status.compare_exchange(
                current,
                TaskStatus::Canceled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        debug!(task_id = %self.id, "Task canceled");
        self.cleanup();
    }

    /// `Init -> Running`. Returns false if the task was canceled first.
    pub(crate) fn start(&self) -> bool {
        self.status
            .compare_exchange(
                TaskStatus::Init as u8,
                TaskStatus::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Running -> Done`. A task canceled mid-run stays `Canceled`.
    pub(crate) fn finish(&self) {
        let _ = self.status.compare_exchange(
            TaskStatus::Running as u8,
            TaskStatus::Done as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Stores the run context's token so `cancel` can stop in-flight work.
    pub(crate) fn arm(&self, token: CancellationToken) {
        let armed = self.cancel.set(token).is_ok();
        // cleanup may have run before the token existed
        if armed && self.cancel_flag.load(Ordering::SeqCst) {
            if let Some(token) = self.cancel.get() {
                token.cancel();
            }
        }
    }

    pub(crate) fn push_path(&self, stage: &str) {
        self.path
            .lock()
            .expect("lock not poisoned")
            .push(stage.to_string());
    }

    pub(crate) fn set_err(&self, err: TaskError) {
        *self.error.lock().expect("lock not poisoned") = Some(err);
    }

    /// Removes the task from the registry and cancels its run context.
    ///
    /// Runs at most once; returns whether this call did the work.
    pub(crate) fn cleanup(&self) -> bool {
        if self.cancel_flag.swap(true, Ordering::SeqCst) {
            return false;
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
        if let Some(token) = self.cancel.get() {
            token.cancel();
        }
        true
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("status", &self.status())
            .field("path", &self.path())
            .finish()
    }
}
