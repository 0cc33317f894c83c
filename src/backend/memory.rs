//! Process-local backend.
//!
//! Same contract as the Redis backend (priority ordering, hex ids,
//! cancel-before-pop, recorded results) without durability. Reports are also
//! kept in arrival order so callers can wait on them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use super::{
    Backend, BackendError, PoppedTask, ReportStatus, ResultRecord, TaskEnvelope, TaskReport,
};
use crate::error::TaskError;

#[derive(Default)]
struct MemoryState {
    seq: u64,
    /// (priority, seq) -> id; iteration order is pop order.
    queue: BTreeMap<(i64, u64), String>,
    /// id -> (queue key, body) for entries still queued.
    queued: HashMap<String, ((i64, u64), TaskEnvelope)>,
    results: HashMap<String, ResultRecord>,
    reports: Vec<TaskReport>,
}

/// In-memory [`Backend`].
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    reported: watch::Sender<usize>,
    available: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (reported, _) = watch::channel(0);
        Self {
            state: Mutex::new(MemoryState::default()),
            reported,
            available: AtomicBool::new(true),
        }
    }

    /// Makes `ping` fail (or succeed again), to simulate an unreachable store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of tasks still queued.
    pub fn len(&self) -> usize {
        self.state.lock().expect("lock not poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All reports received so far, in arrival order.
    pub fn reports(&self) -> Vec<TaskReport> {
        self.state.lock().expect("lock not poisoned").reports.clone()
    }

    /// Waits until at least `count` reports have arrived and returns them all.
    ///
    /// Returns `None` if `timeout` elapses first.
    pub async fn wait_for_reports(&self, count: usize, timeout: Duration) -> Option<Vec<TaskReport>> {
        let mut rx = self.reported.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count)).await;
        match reached {
            Ok(Ok(_)) => Some(self.reports()),
            _ => None,
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::ConnectionFailed(
                "memory backend marked unavailable".to_string(),
            ))
        }
    }

    async fn push_task(
        &self,
        envelope: TaskEnvelope,
        priority: i64,
    ) -> Result<String, BackendError> {
        let mut state = self.state.lock().expect("lock not poisoned");
        state.seq += 1;
        let seq = state.seq;
        let id = format!("{:x}", seq);

        state.queue.insert((priority, seq), id.clone());
        state.queued.insert(id.clone(), ((priority, seq), envelope));
        Ok(id)
    }

    async fn pop_task(&self) -> Result<PoppedTask, BackendError> {
        let mut state = self.state.lock().expect("lock not poisoned");
        let Some((_, id)) = state.queue.pop_first() else {
            return Err(BackendError::Empty);
        };

        let (_, envelope) = state.queued.remove(&id).ok_or_else(|| BackendError::Corrupt {
            id: id.clone(),
            reason: "queued id has no body".to_string(),
        })?;
        Ok(PoppedTask::from_envelope(id, envelope))
    }

    async fn cancel_task(&self, id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().expect("lock not poisoned");
        let (key, envelope) = state
            .queued
            .remove(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        state.queue.remove(&key);
        state.results.insert(
            id.to_string(),
            ResultRecord {
                id: id.to_string(),
                task_type: envelope.task_type,
                status: ReportStatus::Canceled,
                error: Some(TaskError::Canceled.to_string()),
                result: None,
                duration_ms: 0,
                finished_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn report_result(&self, report: TaskReport) -> Result<(), BackendError> {
        let count = {
            let mut state = self.state.lock().expect("lock not poisoned");
            state.results.insert(report.id.clone(), report.to_record());
            state.reports.push(report);
            state.reports.len()
        };
        self.reported.send_replace(count);
        Ok(())
    }

    async fn get_result(&self, id: &str) -> Result<Option<ResultRecord>, BackendError> {
        let state = self.state.lock().expect("lock not poisoned");
        Ok(state.results.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(task_type: &str) -> TaskEnvelope {
        TaskEnvelope::new(task_type, json!({"n": 1}), None)
    }

    #[tokio::test]
    async fn test_push_assigns_hex_ids() {
        let backend = MemoryBackend::new();
        let mut ids = Vec::new();
        for _ in 0..16 {
            ids.push(backend.push_task(envelope("echo"), 0).await.expect("push"));
        }

        assert_eq!(ids[0], "1");
        assert_eq!(ids[9], "a");
        assert_eq!(ids[15], "10");
        assert_eq!(backend.len(), 16);
    }

    #[tokio::test]
    async fn test_pop_orders_by_priority_then_fifo() {
        let backend = MemoryBackend::new();
        let low = backend.push_task(envelope("a"), 5).await.expect("push");
        let first = backend.push_task(envelope("b"), 1).await.expect("push");
        let second = backend.push_task(envelope("c"), 1).await.expect("push");

        assert_eq!(backend.pop_task().await.expect("pop").id, first);
        assert_eq!(backend.pop_task().await.expect("pop").id, second);
        assert_eq!(backend.pop_task().await.expect("pop").id, low);
        assert!(matches!(backend.pop_task().await, Err(BackendError::Empty)));
    }

    #[tokio::test]
    async fn test_cancel_before_pop_removes_entry() {
        let backend = MemoryBackend::new();
        let id = backend.push_task(envelope("echo"), 0).await.expect("push");

        backend.cancel_task(&id).await.expect("cancel");
        assert!(backend.is_empty());
        let record = backend.get_result(&id).await.expect("get").expect("record");
        assert_eq!(record.status, ReportStatus::Canceled);
        assert!(backend.reports().is_empty());
        assert!(matches!(backend.pop_task().await, Err(BackendError::Empty)));
        assert!(matches!(
            backend.cancel_task(&id).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_after_pop_is_not_found() {
        let backend = MemoryBackend::new();
        let id = backend.push_task(envelope("echo"), 0).await.expect("push");
        backend.pop_task().await.expect("pop");

        assert!(matches!(
            backend.cancel_task(&id).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_report_is_recorded_and_awaitable() {
        let backend = MemoryBackend::new();
        backend
            .report_result(TaskReport {
                id: "1".to_string(),
                task_type: "echo".to_string(),
                duration: Duration::from_millis(3),
                outcome: Err(TaskError::Canceled),
            })
            .await
            .expect("report");

        let reports = backend
            .wait_for_reports(1, Duration::from_secs(1))
            .await
            .expect("report should be visible");
        assert_eq!(reports.len(), 1);

        let record = backend.get_result("1").await.expect("get").expect("record");
        assert_eq!(record.status, ReportStatus::Canceled);
        assert!(backend.get_result("2").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_wait_for_reports_times_out() {
        let backend = MemoryBackend::new();
        assert!(backend
            .wait_for_reports(1, Duration::from_millis(10))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_ping_follows_availability() {
        let backend = MemoryBackend::new();
        assert!(backend.ping().await.is_ok());

        backend.set_available(false);
        assert!(matches!(
            backend.ping().await,
            Err(BackendError::ConnectionFailed(_))
        ));
    }
}
