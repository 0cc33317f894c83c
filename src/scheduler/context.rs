//! Per-run task context: a cancellation token plus an optional deadline.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

/// Context handed to every stage of a task run.
///
/// The token is a child of the scheduler's base token, so canceling the base
/// cancels every running task. When a deadline is set, a timer cancels the
/// token when it passes, and canceling the token stops the timer.
#[derive(Debug, Clone)]
pub struct TaskContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl TaskContext {
    /// A context that is never canceled unless [`cancel`](Self::cancel) is called.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derives a context from `parent`, bounded by `timeout` when it is non-zero.
    ///
    /// Must be called inside a tokio runtime when a timeout is given.
    pub fn child_of(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        let token = parent.child_token();
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);

        if let Some(deadline) = deadline {
            let timer = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => timer.cancel(),
                    _ = timer.cancelled() => {}
                }
            });
        }

        Self { token, deadline }
    }

    /// `None` while the context is live, otherwise why it ended.
    pub fn err(&self) -> Option<TaskError> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(TaskError::DeadlineExceeded);
        }
        if self.token.is_cancelled() {
            return Some(TaskError::Canceled);
        }
        None
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is canceled or its deadline passes.
    pub async fn done(&self) {
        self.token.cancelled().await
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The underlying token, for handing to code that speaks `CancellationToken`.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
