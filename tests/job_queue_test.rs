//! Job queue: local threads, admission, distributed backend and batches

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskforge::jobs::{
    all_done, status_counts, submit_batch, wait_for_all, DispatchRequest, JobFn, JobKwargs,
    PendingResult,
};
use taskforge::{
    AdmissionPolicy, DistributedBackend, ForgeError, JobQueue, JobQueueConfig, JobSpec, JobStatus,
    JobType, TokioBackend,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

fn double(args: &[Value], _kwargs: &JobKwargs) -> anyhow::Result<Value> {
    let n = args.first().and_then(Value::as_i64).unwrap_or(0);
    Ok(json!(n * 2))
}

fn fail(_args: &[Value], _kwargs: &JobKwargs) -> anyhow::Result<Value> {
    anyhow::bail!("model endpoint unreachable")
}

/// Job body that spins until the gate opens
fn gated(gate: &Arc<AtomicBool>, value: Value) -> JobSpec {
    let gate = Arc::clone(gate);
    JobSpec::new(
        JobType::VideoGeneration,
        "studio",
        "render",
        move |_: &[Value], _: &JobKwargs| {
            while !gate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(value.clone())
        },
    )
}

fn wait_status(queue: &JobQueue, job_id: &str, status: JobStatus) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while queue.get_status(job_id) != Some(status) {
        assert!(Instant::now() < deadline, "job {} never reached {}", job_id, status);
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn bounded(max: usize, admission: AdmissionPolicy) -> JobQueue {
    JobQueue::new(JobQueueConfig {
        max_concurrent_jobs: max,
        admission,
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn test_local_job_completes() {
    let queue = JobQueue::new(JobQueueConfig::default()).unwrap();
    let job_id = queue
        .submit(JobSpec::new(JobType::TextGeneration, "blog", "outline", double).arg(json!(21)))
        .unwrap();

    assert_eq!(queue.get_result(&job_id, WAIT).unwrap(), Some(json!(42)));
    let job = queue.get(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.priority, 5);
    assert!(job.duration().is_some());

    let snapshot = job.snapshot();
    assert_eq!(snapshot.result.as_deref(), Some("42"));
    assert_eq!(snapshot.tab_name, "blog");
}

#[test]
fn test_local_failure_is_recorded() {
    let queue = JobQueue::new(JobQueueConfig::default()).unwrap();
    let job_id = queue
        .submit(JobSpec::new(JobType::ImageGeneration, "studio", "mockup", fail))
        .unwrap();

    assert_eq!(queue.get_result(&job_id, WAIT).unwrap(), None);
    let job = queue.get(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("unreachable"));
}

#[test]
fn test_unknown_job_ids() {
    let queue = JobQueue::new(JobQueueConfig::default()).unwrap();
    assert!(matches!(
        queue.get_result("missing", None),
        Err(ForgeError::JobNotFound(_))
    ));
    assert_eq!(queue.get_status("missing"), None);
    assert!(!queue.cancel("missing"));
}

#[test]
fn test_backlog_runs_in_submit_order() {
    let queue = bounded(1, AdmissionPolicy::Queue);
    let gate = Arc::new(AtomicBool::new(false));
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = queue.submit(gated(&gate, json!("first"))).unwrap();
    let mut later = Vec::new();
    for label in ["second", "third"] {
        let seen = Arc::clone(&order);
        let spec = JobSpec::new(
            JobType::TextGeneration,
            "blog",
            label,
            move |_: &[Value], _: &JobKwargs| {
                seen.lock().push(label);
                Ok(json!(label))
            },
        )
        .priority(10);
        later.push(queue.submit(spec).unwrap());
    }

    assert_eq!(queue.get_status(&later[0]), Some(JobStatus::Queued));
    assert_eq!(queue.stats().backlog, 2);

    gate.store(true, Ordering::SeqCst);
    assert_eq!(queue.get_result(&first, WAIT).unwrap(), Some(json!("first")));
    for job_id in &later {
        wait_status(&queue, job_id, JobStatus::Completed);
    }
    assert_eq!(*order.lock(), vec!["second", "third"]);
    assert_eq!(queue.stats().backlog, 0);
}

#[test]
fn test_reject_policy_refuses_over_ceiling() {
    let queue = bounded(1, AdmissionPolicy::Reject);
    let gate = Arc::new(AtomicBool::new(false));
    let running = queue.submit(gated(&gate, Value::Null)).unwrap();

    let err = queue
        .submit(JobSpec::new(JobType::TextGeneration, "blog", "extra", double))
        .unwrap_err();
    assert!(matches!(err, ForgeError::ResourceExhausted { .. }));
    assert_eq!(queue.stats().total_jobs, 1);

    gate.store(true, Ordering::SeqCst);
    wait_status(&queue, &running, JobStatus::Completed);
}

#[test]
fn test_cancel_queued_job_never_runs() {
    let queue = bounded(1, AdmissionPolicy::Queue);
    let gate = Arc::new(AtomicBool::new(false));
    let runs = Arc::new(AtomicUsize::new(0));

    let blocker = queue.submit(gated(&gate, Value::Null)).unwrap();
    let counter = Arc::clone(&runs);
    let waiting = queue
        .submit(JobSpec::new(
            JobType::TextGeneration,
            "blog",
            "never",
            move |_: &[Value], _: &JobKwargs| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            },
        ))
        .unwrap();

    assert!(queue.cancel(&waiting));
    assert!(!queue.cancel(&waiting));
    assert_eq!(queue.get_status(&waiting), Some(JobStatus::Cancelled));
    assert_eq!(queue.stats().backlog, 0);

    gate.store(true, Ordering::SeqCst);
    wait_status(&queue, &blocker, JobStatus::Completed);
    assert!(queue.shutdown(Duration::from_secs(5)).is_clean());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cancel_running_job_discards_outcome() {
    let queue = JobQueue::new(JobQueueConfig::default()).unwrap();
    let gate = Arc::new(AtomicBool::new(false));
    let job_id = queue.submit(gated(&gate, json!("late"))).unwrap();
    wait_status(&queue, &job_id, JobStatus::Running);

    assert!(queue.cancel(&job_id));
    gate.store(true, Ordering::SeqCst);
    assert!(queue.shutdown(Duration::from_secs(5)).is_clean());

    let job = queue.get(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.result, None);
}

#[test]
fn test_list_orders_by_priority_and_filters() {
    let queue = JobQueue::new(JobQueueConfig::default()).unwrap();
    let mut ids = Vec::new();
    for priority in [3, 8, 5] {
        let spec = JobSpec::new(JobType::BlogGeneration, "blog", "post", double)
            .arg(json!(priority))
            .priority(priority);
        ids.push(queue.submit(spec).unwrap());
    }
    ids.push(
        queue
            .submit(JobSpec::new(JobType::ImageGeneration, "studio", "hero", fail))
            .unwrap(),
    );
    for job_id in &ids {
        queue.get_result(job_id, WAIT).unwrap();
    }

    let priorities: Vec<u8> = queue
        .list(Some("blog"), None)
        .iter()
        .map(|job| job.priority)
        .collect();
    assert_eq!(priorities, vec![8, 5, 3]);
    assert_eq!(queue.list(None, Some(JobStatus::Failed)).len(), 1);

    let stats = queue.stats();
    assert_eq!(stats.total_jobs, 4);
    assert_eq!((stats.completed, stats.failed), (3, 1));
    assert_eq!(stats.tab_counts.get("blog"), Some(&3));
    assert_eq!(stats.backend, None);
    assert_eq!(stats.max_concurrent, 10);

    assert_eq!(queue.clear_completed(Some("blog")), 3);
    assert_eq!(queue.list(None, None).len(), 1);
    assert_eq!(queue.clear_completed(None), 1);
}

#[test]
fn test_distributed_backend_runs_jobs() {
    let backend = Arc::new(TokioBackend::new(2, 4.0).unwrap());
    let queue = JobQueue::with_backend(JobQueueConfig::default(), backend).unwrap();

    let job_id = queue
        .submit(JobSpec::new(JobType::TextGeneration, "blog", "title", double).arg(json!(4)))
        .unwrap();
    assert_eq!(queue.get_result(&job_id, WAIT).unwrap(), Some(json!(8)));
    assert_eq!(queue.get_status(&job_id), Some(JobStatus::Completed));

    let failing = queue
        .submit(JobSpec::new(JobType::ImageGeneration, "studio", "hero", fail))
        .unwrap();
    match queue.get_result(&failing, WAIT) {
        Err(ForgeError::JobFailed { message, .. }) => assert!(message.contains("unreachable")),
        other => panic!("expected JobFailed, got {:?}", other),
    }
    assert_eq!(queue.get_status(&failing), Some(JobStatus::Failed));

    let stats = queue.stats();
    assert_eq!(stats.backend.as_deref(), Some("tokio"));
    assert!(stats.backend_available);
    queue.shutdown(Duration::from_secs(5));
}

#[test]
fn test_distributed_timeout_leaves_job_running() {
    let backend = Arc::new(TokioBackend::new(1, 4.0).unwrap());
    let queue = JobQueue::with_backend(JobQueueConfig::default(), backend).unwrap();
    let gate = Arc::new(AtomicBool::new(false));

    let job_id = queue.submit(gated(&gate, json!("rendered"))).unwrap();
    assert_eq!(
        queue.get_result(&job_id, Some(Duration::from_millis(50))).unwrap(),
        None
    );
    assert_eq!(queue.get_status(&job_id), Some(JobStatus::Running));

    gate.store(true, Ordering::SeqCst);
    assert_eq!(queue.get_result(&job_id, WAIT).unwrap(), Some(json!("rendered")));
    queue.shutdown(Duration::from_secs(5));
}

/// Backend that is never available
struct Offline;

impl DistributedBackend for Offline {
    fn name(&self) -> &str {
        "offline"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn dispatch(&self, _request: DispatchRequest) -> taskforge::Result<Box<dyn PendingResult>> {
        Err(ForgeError::backend("offline", "not connected"))
    }
}

#[test]
fn test_unavailable_backend_falls_back_to_local() {
    let queue = JobQueue::with_backend(JobQueueConfig::default(), Arc::new(Offline)).unwrap();
    let job_id = queue
        .submit(JobSpec::new(JobType::WorkflowExecution, "flows", "step", double).arg(json!(5)))
        .unwrap();

    assert_eq!(queue.get_result(&job_id, WAIT).unwrap(), Some(json!(10)));
    let stats = queue.stats();
    assert_eq!(stats.backend.as_deref(), Some("offline"));
    assert!(!stats.backend_available);
}

#[test]
fn test_batch_wait_for_all() {
    let queue = JobQueue::new(JobQueueConfig::default()).unwrap();
    let even_only: Arc<dyn JobFn> = Arc::new(
        |args: &[Value], _: &JobKwargs| -> anyhow::Result<Value> {
            let n = args.first().and_then(Value::as_i64).unwrap_or(0);
            anyhow::ensure!(n % 2 == 0, "odd input {}", n);
            Ok(json!(n / 2))
        },
    );

    let ids = submit_batch(
        &queue,
        "catalog",
        "halve",
        vec![json!(2), json!(3), json!(4), json!(5)],
        even_only,
        JobType::BatchOperation,
        5,
    )
    .unwrap();

    let outcome = wait_for_all(&queue, &ids, Duration::from_millis(5), Duration::from_secs(10));
    assert_eq!(outcome.total, 4);
    assert_eq!(outcome.completed.len(), 2);
    assert_eq!(outcome.failed.len(), 2);
    assert_eq!(outcome.success_rate, 0.5);
    assert!(!outcome.all_succeeded());
    assert_eq!(outcome.completed[&ids[0]], Some(json!(1)));

    assert!(all_done(&queue, &ids));
    let counts = status_counts(&queue, &ids);
    assert_eq!((counts.completed, counts.failed, counts.running), (2, 2, 0));
}

#[test]
fn test_shutdown_refuses_new_jobs() {
    let queue = JobQueue::new(JobQueueConfig::default()).unwrap();
    assert!(queue.shutdown(Duration::from_millis(50)).is_clean());
    assert!(matches!(
        queue.submit(JobSpec::new(JobType::TextGeneration, "blog", "late", double)),
        Err(ForgeError::ShuttingDown)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_distributed_polling_from_async_context() {
    let backend = Arc::new(TokioBackend::new(1, 1.0).unwrap());
    let queue = JobQueue::with_backend(JobQueueConfig::default(), backend).unwrap();
    let job_id = queue
        .submit(JobSpec::new(JobType::TextGeneration, "blog", "tagline", double).arg(json!(8)))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while queue.get_status(&job_id) != Some(JobStatus::Completed) {
        assert!(Instant::now() < deadline, "job never completed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(all_done(&queue, &[job_id.clone()]));
    assert_eq!(queue.get_result(&job_id, None).unwrap(), Some(json!(16)));

    let waited = queue
        .submit(JobSpec::new(JobType::TextGeneration, "blog", "slug", double).arg(json!(3)))
        .unwrap();
    assert_eq!(queue.get_result(&waited, WAIT).unwrap(), Some(json!(6)));

    queue.shutdown(Duration::from_secs(1));
}

#[test]
fn test_panicking_job_still_starts_backlog() {
    let queue = bounded(1, AdmissionPolicy::Queue);
    let gate = Arc::new(AtomicBool::new(false));
    let open = Arc::clone(&gate);
    let crashing = queue
        .submit(JobSpec::new(
            JobType::VideoGeneration,
            "studio",
            "encode",
            move |_: &[Value], _: &JobKwargs| -> anyhow::Result<Value> {
                while !open.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(2));
                }
                panic!("encoder crashed");
            },
        ))
        .unwrap();
    let next = queue
        .submit(JobSpec::new(JobType::TextGeneration, "blog", "after", double).arg(json!(2)))
        .unwrap();
    assert_eq!(queue.get_status(&next), Some(JobStatus::Queued));

    gate.store(true, Ordering::SeqCst);
    assert_eq!(queue.get_result(&next, WAIT).unwrap(), Some(json!(4)));

    let crashed = queue.get(&crashing).unwrap();
    assert_eq!(crashed.status, JobStatus::Failed);
    assert_eq!(crashed.error.as_deref(), Some("Job thread panicked"));
    assert_eq!(queue.stats().backlog, 0);
}
