//! End-to-end scheduler tests against the in-memory backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use taskflow::backend::{Backend, MemoryBackend, ReportStatus, TaskReport};
use taskflow::metrics::SchedulerMetrics;
use taskflow::{Scheduler, SchedulerConfig, SchedulerError, StageInput, TaskError, TaskStatus};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn new_scheduler(backend: &Arc<MemoryBackend>) -> Scheduler {
    let config = SchedulerConfig::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_drain_poll_interval(Duration::from_millis(5));
    Scheduler::new(config, Arc::clone(backend) as Arc<dyn Backend>)
}

fn start(
    scheduler: &Arc<Scheduler>,
) -> (CancellationToken, JoinHandle<Result<(), SchedulerError>>) {
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(scheduler).run(shutdown.clone()));
    (shutdown, handle)
}

async fn stop(shutdown: CancellationToken, handle: JoinHandle<Result<(), SchedulerError>>) {
    shutdown.cancel();
    handle
        .await
        .expect("run should not panic")
        .expect("run should stop cleanly");
}

async fn reports(backend: &MemoryBackend, count: usize) -> Vec<TaskReport> {
    backend
        .wait_for_reports(count, WAIT)
        .await
        .unwrap_or_else(|| panic!("expected {} reports, got {:?}", count, backend.reports()))
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition should be reached");
}

fn running_tasks(scheduler: &Scheduler) -> usize {
    let mut running = 0;
    scheduler.peek_running(|task| {
        if task.status() == TaskStatus::Running {
            running += 1;
        }
        true
    });
    running
}

/// Appends `label` to the array produced by the previous stage.
fn append_label(input: StageInput, label: &str) -> Value {
    let mut items = match input.into_value() {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    items.push(json!(label));
    Value::Array(items)
}

#[tokio::test]
async fn test_echo_round_trip() {
    let backend = Arc::new(MemoryBackend::new());
    let metrics = SchedulerMetrics::new().expect("metrics");
    let scheduler = Arc::new(new_scheduler(&backend).with_metrics(metrics.clone()));
    scheduler.register("echo", "reply", |_ctx, task, input: StageInput| async move {
        assert!(input.is_begin());
        Ok::<_, TaskError>(task.data().clone())
    });
    let (shutdown, handle) = start(&scheduler);

    let id = scheduler
        .push("echo", json!({"x": 1}), None)
        .await
        .expect("push");
    let reports = reports(&backend, 1).await;

    assert_eq!(reports[0].id, id);
    assert_eq!(reports[0].status(), ReportStatus::Completed);
    assert_eq!(reports[0].result(), Some(&json!({"x": 1})));

    let record = backend
        .get_result(&id)
        .await
        .expect("get_result")
        .expect("record should exist");
    assert_eq!(record.status, ReportStatus::Completed);
    assert_eq!(record.task_type, "echo");

    stop(shutdown, handle).await;
    assert_eq!(scheduler.running_count(), 0);
    assert_eq!(scheduler.stats().completed, 1);
    assert!(metrics.export().contains("taskflow_tasks_total"));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reports_deadline_exceeded() {
    let backend = Arc::new(MemoryBackend::new());
    let scheduler = Arc::new(new_scheduler(&backend));
    scheduler.register("slow", "sleep", |ctx, _task, _input| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        match ctx.err() {
            Some(err) => Err(err),
            None => Ok(Value::Null),
        }
    });
    let (shutdown, handle) = start(&scheduler);

    scheduler
        .push("slow", json!(null), Some(Duration::from_millis(10)))
        .await
        .expect("push");
    let reports = reports(&backend, 1).await;

    assert!(matches!(
        reports[0].error(),
        Some(TaskError::DeadlineExceeded)
    ));
    assert_eq!(reports[0].status(), ReportStatus::Timeout);

    stop(shutdown, handle).await;
    assert_eq!(scheduler.stats().timed_out, 1);
}

#[tokio::test]
async fn test_stages_run_in_registration_order() {
    let backend = Arc::new(MemoryBackend::new());
    let scheduler = Arc::new(new_scheduler(&backend));
    scheduler
        .register("chain", "a", |_ctx, _task, input| async move {
            Ok::<_, TaskError>(append_label(input, "a"))
        })
        .append("b", |_ctx, _task, input| async move {
            Ok::<_, TaskError>(append_label(input, "b"))
        })
        .append("c", |_ctx, _task, input| async move {
            Ok::<_, TaskError>(append_label(input, "c"))
        });
    let (shutdown, handle) = start(&scheduler);

    scheduler.push("chain", json!(null), None).await.expect("push");
    let reports = reports(&backend, 1).await;

    assert_eq!(reports[0].result(), Some(&json!(["a", "b", "c"])));
    stop(shutdown, handle).await;
}

#[tokio::test]
async fn test_stage_error_stops_pipeline() {
    let backend = Arc::new(MemoryBackend::new());
    let scheduler = Arc::new(new_scheduler(&backend));
    let later_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&later_calls);

    scheduler
        .register("fragile", "validate", |_ctx, _task, _input| async move {
            Err::<Value, _>(TaskError::msg("invalid payload"))
        })
        .append("store", move |_ctx, _task, _input| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TaskError>(Value::Null)
            }
        });
    let (shutdown, handle) = start(&scheduler);

    scheduler.push("fragile", json!(1), None).await.expect("push");
    let reports = reports(&backend, 1).await;

    assert_eq!(reports[0].status(), ReportStatus::Failed);
    assert_eq!(
        reports[0].error().map(|e| e.to_string()),
        Some("invalid payload".to_string())
    );
    assert_eq!(later_calls.load(Ordering::SeqCst), 0);

    stop(shutdown, handle).await;
    assert_eq!(scheduler.stats().failed, 1);
}

#[tokio::test]
async fn test_cancel_before_pop_never_runs_handler() {
    let backend = Arc::new(MemoryBackend::new());
    let scheduler = Arc::new(new_scheduler(&backend));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    scheduler.register("echo", "reply", move |_ctx, _task, _input| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, TaskError>(Value::Null)
        }
    });

    let canceled = scheduler.push("echo", json!(1), None).await.expect("push");
    scheduler.cancel(&canceled).await.expect("cancel");
    let kept = scheduler.push("echo", json!(2), None).await.expect("push");

    let (shutdown, handle) = start(&scheduler);
    let reports = reports(&backend, 1).await;
    assert_eq!(reports[0].id, kept);

    stop(shutdown, handle).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let record = backend
        .get_result(&canceled)
        .await
        .expect("get_result")
        .expect("cancel should be recorded");
    assert_eq!(record.status, ReportStatus::Canceled);
}

#[tokio::test]
async fn test_cancel_running_task() {
    let backend = Arc::new(MemoryBackend::new());
    let scheduler = Arc::new(new_scheduler(&backend));
    scheduler.register("hold", "wait", |ctx, _task, _input| async move {
        ctx.done().await;
        Err::<Value, _>(ctx.err().unwrap_or(TaskError::Canceled))
    });
    let (shutdown, handle) = start(&scheduler);

    let id = scheduler.push("hold", json!(null), None).await.expect("push");
    wait_until(|| running_tasks(&scheduler) == 1).await;

    scheduler.cancel(&id).await.expect("cancel");
    assert_eq!(scheduler.running_count(), 0);

    let reports = reports(&backend, 1).await;
    assert_eq!(reports[0].status(), ReportStatus::Canceled);

    // cancel again is a no-op against the registry and NotFound in the backend
    assert!(scheduler.cancel(&id).await.is_err());

    stop(shutdown, handle).await;
    assert_eq!(scheduler.stats().canceled, 1);
}

#[tokio::test]
async fn test_base_token_cancels_running_tasks() {
    let backend = Arc::new(MemoryBackend::new());
    let base = CancellationToken::new();
    let scheduler = Arc::new(new_scheduler(&backend).with_base_token(base.clone()));
    scheduler.register("hold", "wait", |ctx, _task, _input| async move {
        ctx.done().await;
        Err::<Value, _>(ctx.err().unwrap_or(TaskError::Canceled))
    });
    let (shutdown, handle) = start(&scheduler);

    scheduler.push("hold", json!(1), None).await.expect("push");
    scheduler.push("hold", json!(2), None).await.expect("push");
    wait_until(|| running_tasks(&scheduler) == 2).await;

    base.cancel();
    let reports = reports(&backend, 2).await;
    assert!(reports
        .iter()
        .all(|r| r.status() == ReportStatus::Canceled));

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn test_panic_is_contained() {
    let backend = Arc::new(MemoryBackend::new());
    let scheduler = Arc::new(new_scheduler(&backend));
    scheduler
        .register("bomb", "prep", |_ctx, _task, _input| async move {
            Ok::<_, TaskError>(Value::Null)
        })
        .append("explode", |_ctx, _task, _input| async move {
            if true {
                panic!("boom");
            }
            Ok::<_, TaskError>(Value::Null)
        });
    scheduler.register("echo", "reply", |_ctx, task, _input| async move {
        Ok::<_, TaskError>(task.data().clone())
    });
    let (shutdown, handle) = start(&scheduler);

    let bomb = scheduler.push("bomb", json!(null), None).await.expect("push");
    let first = reports(&backend, 1).await;
    assert_eq!(first[0].id, bomb);
    match first[0].error() {
        Some(TaskError::Unexpected { message, path }) => {
            assert_eq!(message, "boom");
            assert_eq!(path, &vec!["prep".to_string(), "explode".to_string()]);
        }
        other => panic!("expected an unexpected error, got {:?}", other),
    }

    scheduler.push("echo", json!("after"), None).await.expect("push");
    let all = reports(&backend, 2).await;
    assert_eq!(all[1].result(), Some(&json!("after")));

    stop(shutdown, handle).await;
    let stats = scheduler.stats();
    assert_eq!(stats.panicked, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_registry_tracks_running_tasks() {
    let backend = Arc::new(MemoryBackend::new());
    let scheduler = Arc::new(new_scheduler(&backend));
    let gate = CancellationToken::new();
    let held = gate.clone();
    scheduler.register("hold", "wait", move |_ctx, _task, _input| {
        let gate = held.clone();
        async move {
            gate.cancelled().await;
            Ok::<_, TaskError>(json!("released"))
        }
    });
    let (shutdown, handle) = start(&scheduler);

    let mut pushed = vec![
        scheduler.push("hold", json!(1), None).await.expect("push"),
        scheduler.push("hold", json!(2), None).await.expect("push"),
    ];
    wait_until(|| running_tasks(&scheduler) == 2).await;

    let mut seen = Vec::new();
    scheduler.peek_running(|task| {
        seen.push(task.id().to_string());
        true
    });
    seen.sort();
    pushed.sort();
    assert_eq!(seen, pushed);

    let mut visited = 0;
    scheduler.peek_running(|_| {
        visited += 1;
        false
    });
    assert_eq!(visited, 1);

    gate.cancel();
    reports(&backend, 2).await;
    wait_until(|| scheduler.running_count() == 0).await;

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn test_missing_pipeline_is_reported() {
    let backend = Arc::new(MemoryBackend::new());
    let producer = new_scheduler(&backend);
    producer.register("ghost", "noop", |_ctx, _task, _input| async move {
        Ok::<_, TaskError>(Value::Null)
    });
    let id = producer.push("ghost", json!(null), None).await.expect("push");

    let worker = Arc::new(new_scheduler(&backend));
    let (shutdown, handle) = start(&worker);
    let reports = reports(&backend, 1).await;

    assert_eq!(reports[0].id, id);
    assert!(matches!(reports[0].error(), Some(TaskError::NoPipeline(t)) if t == "ghost"));
    stop(shutdown, handle).await;
}

#[tokio::test]
async fn test_shutdown_waits_for_running_tasks() {
    let backend = Arc::new(MemoryBackend::new());
    let scheduler = Arc::new(new_scheduler(&backend));
    scheduler.register("slow", "sleep", |_ctx, _task, _input| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, TaskError>(json!("finished"))
    });
    let (shutdown, handle) = start(&scheduler);

    scheduler.push("slow", json!(null), None).await.expect("push");
    wait_until(|| running_tasks(&scheduler) == 1).await;

    stop(shutdown, handle).await;

    let reports = backend.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status(), ReportStatus::Completed);
    assert!(!scheduler.is_running());
}

#[tokio::test]
async fn test_shutdown_completes_popped_tasks() {
    let backend = Arc::new(MemoryBackend::new());
    let config = SchedulerConfig::default()
        .with_wait_buffer(1)
        .with_poll_interval(Duration::from_millis(5))
        .with_drain_poll_interval(Duration::from_millis(5));
    let scheduler = Arc::new(Scheduler::new(config, Arc::clone(&backend) as Arc<dyn Backend>));

    let gate = Arc::new(Semaphore::new(0));
    let handler_gate = Arc::clone(&gate);
    scheduler.register("gated", "wait", move |_ctx, task, _input| {
        let gate = Arc::clone(&handler_gate);
        async move {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| TaskError::msg(e.to_string()))?;
            Ok::<_, TaskError>(task.data().clone())
        }
    });
    let (shutdown, handle) = start(&scheduler);

    for i in 0..5 {
        scheduler.push("gated", json!(i), None).await.expect("push");
    }
    wait_until(|| backend.is_empty() && running_tasks(&scheduler) == 5).await;

    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!handle.is_finished(), "shutdown must wait for popped tasks");

    gate.add_permits(5);
    handle
        .await
        .expect("run should not panic")
        .expect("run should stop cleanly");

    let reports = backend.reports();
    assert_eq!(reports.len(), 5);
    assert!(reports.iter().all(|r| r.status() == ReportStatus::Completed));
    assert_eq!(scheduler.stats().completed, 5);
    assert_eq!(scheduler.running_count(), 0);
}

#[tokio::test]
async fn test_unavailable_backend_is_fatal() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_available(false);
    let scheduler = Arc::new(new_scheduler(&backend));

    let result = Arc::clone(&scheduler).run(CancellationToken::new()).await;
    assert!(matches!(result, Err(SchedulerError::BackendUnavailable(_))));
}
