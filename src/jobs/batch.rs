//! Helpers for callers that fan work out over many jobs.

use crate::core::errors::Result;
use crate::jobs::model::{JobFn, JobId, JobSpec, JobStatus, JobType};
use crate::jobs::queue::JobQueue;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Submit one job per item, each called with the item as its only argument
pub fn submit_batch(
    queue: &JobQueue,
    tab_name: &str,
    operation: &str,
    items: Vec<Value>,
    function: Arc<dyn JobFn>,
    job_type: JobType,
    priority: u8,
) -> Result<Vec<JobId>> {
    let total = items.len();
    let mut job_ids = Vec::with_capacity(total);
    for (index, item) in items.into_iter().enumerate() {
        let spec = JobSpec::with_function(
            job_type,
            tab_name,
            format!("{} [{}/{}]", operation, index + 1, total),
            Arc::clone(&function),
        )
        .arg(item)
        .priority(priority)
        .meta("batch_index", json!(index))
        .meta("batch_total", json!(total))
        .meta("operation", json!(operation));
        job_ids.push(queue.submit(spec)?);
    }
    info!(jobs = job_ids.len(), operation = %operation, "Submitted batch");
    Ok(job_ids)
}

/// Results in the order of `job_ids`; failures and unfinished jobs give `None`
pub fn collect_results(
    queue: &JobQueue,
    job_ids: &[JobId],
    timeout: Option<Duration>,
) -> Vec<Option<Value>> {
    job_ids
        .iter()
        .map(|job_id| match queue.get_result(job_id, timeout) {
            Ok(result) => result,
            Err(e) => {
                error!(job_id = %job_id, "Failed to get job result: {}", e);
                None
            }
        })
        .collect()
}

/// Outcome of [`wait_for_all`]
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub completed: HashMap<JobId, Option<Value>>,
    pub failed: Vec<JobId>,
    pub cancelled: Vec<JobId>,
    pub total: usize,
    /// Completed share of `total`; 0 for an empty batch
    pub success_rate: f64,
    pub duration: Duration,
}

impl BatchOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.completed.len() == self.total
    }
}

/// Poll every `check_interval` until each job is terminal or `max_wait` passes.
///
/// Unknown ids are skipped and never count as pending.
pub fn wait_for_all(
    queue: &JobQueue,
    job_ids: &[JobId],
    check_interval: Duration,
    max_wait: Duration,
) -> BatchOutcome {
    let started = Instant::now();
    let mut completed = HashMap::new();
    let mut failed = Vec::new();
    let mut cancelled = Vec::new();

    while started.elapsed() < max_wait {
        let mut all_done = true;
        for job_id in job_ids {
            if completed.contains_key(job_id) || failed.contains(job_id) || cancelled.contains(job_id)
            {
                continue;
            }
            match queue.get_status(job_id) {
                Some(JobStatus::Completed) => {
                    let result = queue.get_result(job_id, None).ok().flatten();
                    completed.insert(job_id.clone(), result);
                }
                Some(JobStatus::Failed) => failed.push(job_id.clone()),
                Some(JobStatus::Cancelled) => cancelled.push(job_id.clone()),
                Some(JobStatus::Queued | JobStatus::Running) => all_done = false,
                None => {}
            }
        }
        if all_done {
            break;
        }
        thread::sleep(check_interval);
    }

    let total = job_ids.len();
    let success_rate = if total == 0 {
        0.0
    } else {
        completed.len() as f64 / total as f64
    };
    BatchOutcome {
        completed,
        failed,
        cancelled,
        total,
        success_rate,
        duration: started.elapsed(),
    }
}

/// Number of jobs per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub fn status_counts(queue: &JobQueue, job_ids: &[JobId]) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for job_id in job_ids {
        match queue.get_status(job_id) {
            Some(JobStatus::Queued) => counts.queued += 1,
            Some(JobStatus::Running) => counts.running += 1,
            Some(JobStatus::Completed) => counts.completed += 1,
            Some(JobStatus::Failed) => counts.failed += 1,
            Some(JobStatus::Cancelled) => counts.cancelled += 1,
            None => {}
        }
    }
    counts
}

/// True when no job is still queued or running
pub fn all_done(queue: &JobQueue, job_ids: &[JobId]) -> bool {
    job_ids.iter().all(|job_id| {
        !matches!(
            queue.get_status(job_id),
            Some(JobStatus::Queued | JobStatus::Running)
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobQueueConfig;
    use crate::jobs::model::JobKwargs;

    #[test]
    fn test_empty_batch() {
        let queue = JobQueue::new(JobQueueConfig::default()).unwrap();
        let outcome = wait_for_all(&queue, &[], Duration::from_millis(1), Duration::from_secs(1));
        assert_eq!(outcome.total, 0);
        assert_eq!(outcome.success_rate, 0.0);
        assert!(all_done(&queue, &[]));
    }

    #[test]
    fn test_batch_metadata() {
        let queue = JobQueue::new(JobQueueConfig::default()).unwrap();
        let echo: Arc<dyn JobFn> = Arc::new(|args: &[Value], _: &JobKwargs| -> anyhow::Result<Value> {
            Ok(args.first().cloned().unwrap_or(Value::Null))
        });
        let ids = submit_batch(
            &queue,
            "catalog",
            "resize",
            vec![json!("a.png"), json!("b.png")],
            echo,
            JobType::BatchOperation,
            6,
        )
        .unwrap();

        let second = queue.get(&ids[1]).unwrap();
        assert_eq!(second.description, "resize [2/2]");
        assert_eq!(second.metadata["batch_index"], json!(1));
        assert_eq!(second.priority, 6);

        let results = collect_results(&queue, &ids, Some(Duration::from_secs(5)));
        assert_eq!(results, vec![Some(json!("a.png")), Some(json!("b.png"))]);
    }
}
