//! The scheduler: pop loop, dispatch loop and per-task workers.
//!
//! Popped tasks go through a bounded wait buffer. The pop loop blocks when
//! the buffer is full, so at most `wait_buffer` tasks sit popped but not yet
//! dispatched. Every popped task ends with exactly one report to the backend,
//! including tasks still buffered when shutdown starts: those are dispatched
//! and drained like any other.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::TaskContext;
use super::pipeline::{PipelineHandle, Pipelines, StageInput};
use super::registry::TaskRegistry;
use super::stats::{SchedulerStats, SharedStats};
use super::task::{Task, TaskStatus};
use crate::backend::{Backend, BackendError, PoppedTask, TaskEnvelope, TaskReport};
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, TaskError};
use crate::metrics::SchedulerMetrics;

/// Pulls tasks from a [`Backend`] and runs them through their pipelines.
pub struct Scheduler {
    config: SchedulerConfig,
    backend: Arc<dyn Backend>,
    pipelines: Pipelines,
    registry: Arc<TaskRegistry>,
    base: CancellationToken,
    stats: SharedStats,
    metrics: Option<SchedulerMetrics>,
    is_running: AtomicBool,
}

impl Scheduler {
    /// Creates a scheduler over `backend`. Nothing runs until [`run`](Self::run).
    pub fn new(config: SchedulerConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            config,
            backend,
            pipelines: Pipelines::new(),
            registry: Arc::new(TaskRegistry::default()),
            base: CancellationToken::new(),
            stats: SharedStats::default(),
            metrics: None,
            is_running: AtomicBool::new(false),
        }
    }

    /// Sets the token every task context derives from.
    ///
    /// Canceling it cancels all running tasks. It is independent of the
    /// shutdown token passed to `run`.
    pub fn with_base_token(mut self, token: CancellationToken) -> Self {
        self.base = token;
        self
    }

    /// Records task counts, durations and buffer depth into `metrics`.
    pub fn with_metrics(mut self, metrics: SchedulerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Returns the backend tasks are pushed to and popped from.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Returns the pipeline table.
    pub fn pipelines(&self) -> &Pipelines {
        &self.pipelines
    }

    /// Shorthand for `self.pipelines().register(..)`.
    pub fn register<F, Fut>(
        &self,
        task_type: impl Into<String>,
        name: impl Into<String>,
        handler: F,
    ) -> PipelineHandle<'_>
    where
        F: Fn(TaskContext, Arc<Task>, StageInput) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.pipelines.register(task_type, name, handler)
    }

    /// Enqueues a task with the configured default priority.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::UnknownTaskType` if no pipeline is registered
    /// for `task_type`; the backend is not touched in that case.
    pub async fn push(
        &self,
        task_type: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<String, SchedulerError> {
        self.push_with_priority(task_type, data, timeout, self.config.default_priority)
            .await
    }

    /// Enqueues a task. Lower `priority` pops first; equal priorities pop in
    /// push order.
    pub async fn push_with_priority(
        &self,
        task_type: &str,
        data: Value,
        timeout: Option<Duration>,
        priority: i64,
    ) -> Result<String, SchedulerError> {
        if !self.pipelines.contains(task_type) {
            return Err(SchedulerError::UnknownTaskType(task_type.to_string()));
        }

        let envelope = TaskEnvelope::new(task_type, data, timeout);
        let id = self.backend.push_task(envelope, priority).await?;
        debug!(task_id = %id, task_type = %task_type, priority, "Task pushed");
        Ok(id)
    }

    /// Cancels a task.
    ///
    /// A popped task is canceled in place; otherwise the backend is asked to
    /// drop it from the queue, which fails with `BackendError::NotFound` when
    /// the id is unknown or already finished.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::TaskFinished` if the popped task already
    /// finished and is only waiting for its report.
    pub async fn cancel(&self, id: &str) -> Result<(), SchedulerError> {
        if let Some(task) = self.registry.get(id) {
            task.cancel();
            if task.status() == TaskStatus::Done {
                debug!(task_id = %id, "Cancel ignored, task already finished");
                return Err(SchedulerError::TaskFinished(id.to_string()));
            }
            info!(task_id = %id, "Canceled popped task");
            return Ok(());
        }

        self.backend.cancel_task(id).await?;
        info!(task_id = %id, "Canceled queued task");
        Ok(())
    }

    /// Visits popped, unfinished tasks until `visit` returns false.
    ///
    /// Runs under the registry lock: `visit` must not call
    /// [`Task::cancel`] or any scheduler method that touches the registry.
    pub fn peek_running<F>(&self, visit: F)
    where
        F: FnMut(&Task) -> bool,
    {
        self.registry.for_each(visit);
    }

    /// Number of popped tasks that have not finished yet.
    pub fn running_count(&self) -> usize {
        self.registry.len()
    }

    /// Returns a snapshot of the task counters.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.snapshot()
    }

    /// Returns true while `run` is active.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Runs the pop and dispatch loops until `shutdown` fires.
    ///
    /// On shutdown, popping stops and tasks still waiting in the buffer are
    /// dispatched, then the call waits for every popped task to leave the
    /// registry before returning.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Config` if the configuration does not
    /// validate, `SchedulerError::BackendUnavailable` if the backend does not
    /// answer the startup ping, and `SchedulerError::AlreadyRunning` if the
    /// loops are already running.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), SchedulerError> {
        self.config.validate()?;

        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        if let Err(e) = self.backend.ping().await {
            self.is_running.store(false, Ordering::SeqCst);
            error!(error = %e, "Backend unavailable, scheduler not started");
            return Err(SchedulerError::BackendUnavailable(e));
        }

        info!(
            wait_buffer = self.config.wait_buffer,
            task_types = ?self.pipelines.task_types(),
            "Scheduler started"
        );

        let (tx, rx) = mpsc::channel(self.config.wait_buffer);
        let pop_handle = tokio::spawn(Arc::clone(&self).pop_loop(tx, shutdown.clone()));

        Arc::clone(&self).dispatch_loop(rx, pop_handle, shutdown).await;

        self.is_running.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
        Ok(())
    }

    async fn pop_loop(self: Arc<Self>, tx: mpsc::Sender<Arc<Task>>, shutdown: CancellationToken) {
        debug!("Pop loop started");

        while !shutdown.is_cancelled() {
            let popped = match self.backend.pop_task().await {
                Ok(popped) => popped,
                Err(BackendError::Empty) => {
                    self.backoff(&shutdown).await;
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Failed to pop task");
                    self.backoff(&shutdown).await;
                    continue;
                }
            };

            let task = Arc::new(Task::new(popped, Arc::downgrade(&self.registry)));
            if !self.registry.insert(Arc::clone(&task)) {
                self.reject_duplicate(&task).await;
                continue;
            }
            debug!(task_id = %task.id(), task_type = %task.task_type(), "Task popped");

            if let Err(mpsc::error::SendError(task)) = tx.send(task).await {
                // dispatch loop closed the buffer during shutdown
                Arc::clone(&self).dispatch(task).await;
                break;
            }
            self.record_buffer_depth(&tx);
        }

        debug!("Pop loop stopped");
    }

    async fn backoff(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = shutdown.cancelled() => {}
        }
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Arc<Task>>,
        pop_handle: tokio::task::JoinHandle<()>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                received = rx.recv() => {
                    let Some(task) = received else { break };
                    if let Some(metrics) = &self.metrics {
                        metrics.set_wait_buffer_depth(rx.len());
                    }
                    Arc::clone(&self).dispatch(task).await;
                }
            }
        }

        info!("Shutdown requested, draining scheduler");

        rx.close();
        if let Err(e) = pop_handle.await {
            error!(error = %e, "Pop loop panicked");
        }
        let mut buffered = 0usize;
        while let Ok(task) = rx.try_recv() {
            buffered += 1;
            Arc::clone(&self).dispatch(task).await;
        }
        if buffered > 0 {
            info!(buffered, "Dispatched buffered tasks after shutdown");
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_wait_buffer_depth(0);
        }

        self.drain().await;
    }

    /// Waits until no popped task is left in the registry.
    async fn drain(&self) {
        let started = Instant::now();
        let mut last_log = started;

        loop {
            let remaining = self.registry.len();
            if remaining == 0 {
                break;
            }
            if last_log.elapsed() >= self.config.drain_log_interval {
                info!(
                    remaining,
                    waited_secs = started.elapsed().as_secs(),
                    "Waiting for running tasks to finish"
                );
                last_log = Instant::now();
            }
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }

        info!(
            waited_ms = started.elapsed().as_millis() as u64,
            "All running tasks finished"
        );
    }

    /// Spawns a worker for `task`, or reports it canceled if it left `Init`
    /// while buffered.
    async fn dispatch(self: Arc<Self>, task: Arc<Task>) {
        if task.status() != TaskStatus::Init {
            debug!(task_id = %task.id(), status = %task.status(), "Skipping canceled task");
            self.complete(&task, Err(TaskError::Canceled)).await;
            return;
        }

        tokio::spawn(self.run_task(task));
    }

    /// Reports a popped id that is already registered as failed.
    ///
    /// The report goes through a detached task so the live task with the
    /// same id stays registered.
    async fn reject_duplicate(&self, task: &Task) {
        warn!(task_id = %task.id(), "Task id popped twice, reporting duplicate as failed");
        let popped = PoppedTask {
            id: task.id().to_string(),
            task_type: task.task_type().to_string(),
            data: task.data().clone(),
            timeout: task.timeout(),
        };
        let duplicate = Task::new(popped, Weak::new());
        let reason = format!("task id '{}' popped while already running", duplicate.id());
        self.complete(&duplicate, Err(TaskError::msg(reason))).await;
    }

    async fn run_task(self: Arc<Self>, task: Arc<Task>) {
        let ctx = TaskContext::child_of(&self.base, task.timeout());
        task.arm(ctx.token().clone());

        if !task.start() {
            debug!(task_id = %task.id(), "Task canceled before start");
            self.complete(&task, Err(TaskError::Canceled)).await;
            return;
        }

        self.stats.task_started();
        if let Some(metrics) = &self.metrics {
            metrics.task_started();
        }
        debug!(task_id = %task.id(), task_type = %task.task_type(), "Task started");

        let outcome = match self.pipelines.get(task.task_type()) {
            None => Err(TaskError::NoPipeline(task.task_type().to_string())),
            Some(pipeline) => {
                let run = pipeline.process(&ctx, &task, StageInput::Begin);
                match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        let path = task.path();
                        error!(
                            task_id = %task.id(),
                            path = ?path,
                            panic = %message,
                            "Stage panicked"
                        );
                        Err(TaskError::Unexpected { message, path })
                    }
                }
            }
        };

        task.finish();
        self.stats.task_stopped();
        if let Some(metrics) = &self.metrics {
            metrics.task_stopped();
        }

        self.complete(&task, outcome).await;
    }

    /// Records and reports the outcome, then releases the task.
    async fn complete(&self, task: &Task, outcome: Result<Value, TaskError>) {
        if let Err(err) = &outcome {
            task.set_err(err.clone());
        }

        let report = TaskReport {
            id: task.id().to_string(),
            task_type: task.task_type().to_string(),
            duration: task.elapsed(),
            outcome,
        };

        self.stats.record(&report);
        if let Some(metrics) = &self.metrics {
            metrics.record_finished(&report.task_type, report.status(), report.duration);
        }

        match &report.outcome {
            Ok(_) => debug!(
                task_id = %report.id,
                duration_ms = report.duration.as_millis() as u64,
                "Task completed"
            ),
            Err(e) if e.is_context_error() => info!(
                task_id = %report.id,
                status = %report.status(),
                "Task stopped"
            ),
            Err(e) => warn!(
                task_id = %report.id,
                task_type = %report.task_type,
                error = %e,
                "Task failed"
            ),
        }

        let id = report.id.clone();
        if let Err(e) = self.backend.report_result(report).await {
            error!(task_id = %id, error = %e, "Failed to report task result");
        }

        task.cleanup();
    }

    fn record_buffer_depth(&self, tx: &mpsc::Sender<Arc<Task>>) {
        if let Some(metrics) = &self.metrics {
            metrics.set_wait_buffer_depth(tx.max_capacity() - tx.capacity());
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
