//! Job queue shared by many callers.
//!
//! Submit and dispatch are one call. With an available distributed backend
//! the job goes there together with its resource profile; otherwise it runs
//! on its own local thread, subject to the configured concurrency ceiling.

use crate::config::{AdmissionPolicy, JobQueueConfig};
use crate::core::errors::{ForgeError, Result};
use crate::core::limits::{ConcurrencyLimiter, ConcurrencyLimits, ExecutionPermit};
use crate::jobs::backend::{DispatchRequest, DistributedBackend, JobOutcome, PendingResult};
use crate::jobs::model::{Job, JobId, JobSpec, JobStatus};
use crate::jobs::profiles::profile_for;
use crate::tasks::ShutdownReport;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Aggregate view returned by [`JobQueue::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total_jobs: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Local jobs waiting for a free slot
    pub backlog: usize,
    pub backend: Option<String>,
    pub backend_available: bool,
    pub max_concurrent: usize,
    pub tab_counts: BTreeMap<String, usize>,
}

struct QueueInner {
    config: JobQueueConfig,
    jobs: DashMap<JobId, Job>,
    backend: Option<Arc<dyn DistributedBackend>>,
    limiter: Arc<ConcurrencyLimiter>,
    backlog: Mutex<VecDeque<JobId>>,
    pending: Mutex<HashMap<JobId, Box<dyn PendingResult>>>,
    threads: Mutex<HashMap<JobId, JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

/// Thread-safe job queue. Clones share the same state.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    /// Queue that always executes locally
    pub fn new(config: JobQueueConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Queue that prefers `backend` while it reports itself available
    pub fn with_backend(
        config: JobQueueConfig,
        backend: Arc<dyn DistributedBackend>,
    ) -> Result<Self> {
        Self::build(config, Some(backend))
    }

    fn build(
        config: JobQueueConfig,
        backend: Option<Arc<dyn DistributedBackend>>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = ConcurrencyLimiter::new(
            "jobs",
            ConcurrencyLimits::bounded(config.max_concurrent_jobs),
        )?;
        info!(
            backend = backend.as_ref().map(|b| b.name()).unwrap_or("local"),
            max_concurrent = config.max_concurrent_jobs,
            "Job queue initialized"
        );
        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                jobs: DashMap::new(),
                backend,
                limiter,
                backlog: Mutex::new(VecDeque::new()),
                pending: Mutex::new(HashMap::new()),
                threads: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    fn available_backend(&self) -> Option<Arc<dyn DistributedBackend>> {
        self.inner
            .backend
            .as_ref()
            .filter(|backend| backend.is_available())
            .cloned()
    }

    /// Store the job as `Queued` and dispatch it immediately.
    ///
    /// Only admission is reported here (`ShuttingDown`, or `ResourceExhausted`
    /// under [`AdmissionPolicy::Reject`]); execution failures surface through
    /// polling.
    pub fn submit(&self, spec: JobSpec) -> Result<JobId> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ForgeError::ShuttingDown);
        }
        let job = Job::from_spec(Uuid::new_v4().to_string(), spec);
        let job_id = job.id.clone();
        let summary = format!("{}: {}", job.tab_name, job.description);

        if let Some(backend) = self.available_backend() {
            self.inner.jobs.insert(job_id.clone(), job);
            self.dispatch_distributed(&job_id, backend.as_ref());
        } else {
            self.admit_local(job)?;
        }

        info!(job_id = %job_id, "Job submitted ({})", summary);
        Ok(job_id)
    }

    fn dispatch_distributed(&self, job_id: &str, backend: &dyn DistributedBackend) {
        let request = {
            let Some(mut job) = self.inner.jobs.get_mut(job_id) else {
                return;
            };
            job.mark_running();
            DispatchRequest {
                job_id: job.id.clone(),
                job_type: job.job_type,
                profile: profile_for(job.job_type),
                function: Arc::clone(&job.function),
                args: job.args.clone(),
                kwargs: job.kwargs.clone(),
            }
        };

        info!(
            job_id = %job_id,
            backend = backend.name(),
            cpus = request.profile.num_cpus,
            memory_mb = request.profile.memory_mb(),
            "Job allocated"
        );
        match backend.dispatch(request) {
            Ok(pending) => {
                self.inner.pending.lock().insert(job_id.to_string(), pending);
            }
            Err(e) => {
                error!(job_id = %job_id, "Distributed dispatch failed: {}", e);
                if let Some(mut job) = self.inner.jobs.get_mut(job_id) {
                    job.mark_failed(e.to_string());
                }
            }
        }
    }

    fn admit_local(&self, job: Job) -> Result<()> {
        let job_id = job.id.clone();
        let queue_first = self.inner.config.admission == AdmissionPolicy::Queue
            && !self.inner.backlog.lock().is_empty();

        if !queue_first {
            match self.inner.limiter.try_acquire() {
                Ok(permit) => {
                    self.inner.jobs.insert(job_id.clone(), job);
                    self.spawn_local(&job_id, permit);
                    return Ok(());
                }
                Err(e) if self.inner.config.admission == AdmissionPolicy::Reject => {
                    warn!(job_id = %job_id, "Job rejected: {}", e);
                    return Err(e);
                }
                Err(_) => {}
            }
        }

        self.inner.jobs.insert(job_id.clone(), job);
        self.inner.backlog.lock().push_back(job_id.clone());
        debug!(job_id = %job_id, "All local slots busy, job waits in backlog");
        self.drain_backlog();
        Ok(())
    }

    /// Start backlog jobs, oldest first, while slots are free
    fn drain_backlog(&self) {
        loop {
            let (job_id, permit) = {
                let mut backlog = self.inner.backlog.lock();
                if backlog.is_empty() {
                    return;
                }
                let Ok(permit) = self.inner.limiter.try_acquire() else {
                    return;
                };
                match backlog.pop_front() {
                    Some(job_id) => (job_id, permit),
                    None => return,
                }
            };
            let still_queued = self
                .inner
                .jobs
                .get(&job_id)
                .map_or(false, |job| job.status == JobStatus::Queued);
            if still_queued {
                self.spawn_local(&job_id, permit);
            }
        }
    }

    fn spawn_local(&self, job_id: &str, permit: ExecutionPermit) {
        match self.inner.jobs.get_mut(job_id) {
            Some(mut job) if job.status == JobStatus::Queued => job.mark_running(),
            _ => return,
        }

        let queue = self.clone();
        let id = job_id.to_string();
        let spawned = thread::Builder::new()
            .name(format!("job-{}", short_id(job_id)))
            .spawn(move || queue.run_local(id, permit));

        match spawned {
            Ok(handle) => {
                let mut threads = self.inner.threads.lock();
                threads.retain(|_, h| !h.is_finished());
                threads.insert(job_id.to_string(), handle);
            }
            Err(e) => {
                error!(job_id = %job_id, "Could not spawn job thread: {}", e);
                if let Some(mut job) = self.inner.jobs.get_mut(job_id) {
                    job.mark_failed(format!("Could not spawn job thread: {}", e));
                }
            }
        }
    }

    fn run_local(&self, job_id: JobId, permit: ExecutionPermit) {
        let _run = LocalRun {
            queue: self,
            job_id: &job_id,
            permit: Some(permit),
        };
        let work = self.inner.jobs.get(&job_id).and_then(|job| {
            (job.status == JobStatus::Running).then(|| {
                (
                    Arc::clone(&job.function),
                    job.args.clone(),
                    job.kwargs.clone(),
                )
            })
        });

        if let Some((function, args, kwargs)) = work {
            let outcome = function
                .call(&args, &kwargs)
                .map_err(|e| e.to_string());
            if let Err(message) = &outcome {
                error!(job_id = %job_id, "Job failed: {}", message);
            }
            self.resolve(&job_id, outcome);
        }
    }

    /// Record an outcome unless the job already reached a terminal state
    fn resolve(&self, job_id: &str, outcome: JobOutcome) {
        let Some(mut job) = self.inner.jobs.get_mut(job_id) else {
            return;
        };
        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "Discarding outcome of finished job");
            return;
        }
        match outcome {
            Ok(value) => {
                job.mark_completed(value);
                info!(job_id = %job_id, "Job completed");
            }
            Err(message) => job.mark_failed(message),
        }
    }

    /// Non-blocking check on a distributed job's outcome
    fn poll_distributed(&self, job_id: &str) -> Option<JobOutcome> {
        let outcome = {
            let mut pending = self.inner.pending.lock();
            let outcome = pending.get_mut(job_id)?.try_take()?;
            pending.remove(job_id);
            outcome
        };
        self.resolve(job_id, outcome.clone());
        Some(outcome)
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.inner.jobs.get(job_id).map(|job| job.value().clone())
    }

    /// Current status; pulls a ready distributed outcome first
    pub fn get_status(&self, job_id: &str) -> Option<JobStatus> {
        self.poll_distributed(job_id);
        self.inner.jobs.get(job_id).map(|job| job.status)
    }

    /// The job's result, or `None` if it is not (successfully) finished.
    ///
    /// `timeout: None` checks once without blocking. With a timeout the call
    /// waits that long at most; a distributed job still pending afterwards
    /// stays `Running`. A distributed failure is returned as
    /// [`ForgeError::JobFailed`] on the call that observes it.
    pub fn get_result(&self, job_id: &str, timeout: Option<Duration>) -> Result<Option<Value>> {
        if !self.inner.jobs.contains_key(job_id) {
            return Err(ForgeError::JobNotFound(job_id.to_string()));
        }

        let distributed = self.inner.pending.lock().contains_key(job_id);
        if distributed {
            let outcome = match timeout {
                None => self.poll_distributed(job_id),
                Some(timeout) => self.wait_distributed(job_id, timeout),
            };
            match outcome {
                Some(Ok(value)) => return Ok(Some(value)),
                Some(Err(message)) => {
                    return Err(ForgeError::JobFailed {
                        job_id: job_id.to_string(),
                        message,
                    })
                }
                None => {
                    // Another caller may have taken the outcome since the check above
                    let finished = self
                        .inner
                        .jobs
                        .get(job_id)
                        .map_or(false, |job| job.status.is_terminal());
                    if !finished {
                        return Ok(None);
                    }
                }
            }
        }

        if let Some(timeout) = timeout {
            self.wait_local(job_id, timeout);
        }
        Ok(self.inner.jobs.get(job_id).and_then(|job| match job.status {
            JobStatus::Completed => job.result.clone(),
            _ => None,
        }))
    }

    fn wait_distributed(&self, job_id: &str, timeout: Duration) -> Option<JobOutcome> {
        // Taken out so other jobs' polls are not blocked while this one waits
        let mut pending = self.inner.pending.lock().remove(job_id)?;
        match pending.wait(timeout) {
            Some(outcome) => {
                self.resolve(job_id, outcome.clone());
                Some(outcome)
            }
            None => {
                let cancelled = self
                    .inner
                    .jobs
                    .get(job_id)
                    .map_or(true, |job| job.status.is_terminal());
                if cancelled {
                    pending.cancel();
                } else {
                    self.inner.pending.lock().insert(job_id.to_string(), pending);
                }
                None
            }
        }
    }

    fn wait_local(&self, job_id: &str, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let done = self
                .inner
                .jobs
                .get(job_id)
                .map_or(true, |job| job.status.is_terminal());
            let now = Instant::now();
            if done || now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(self.inner.config.result_poll_interval));
        }
    }

    /// Mark the job `Cancelled` and ask the backend to drop it.
    ///
    /// Returns false for unknown or already finished jobs. A local thread
    /// that already started runs to completion; its outcome is discarded.
    pub fn cancel(&self, job_id: &str) -> bool {
        {
            let Some(mut job) = self.inner.jobs.get_mut(job_id) else {
                return false;
            };
            if job.status.is_terminal() {
                return false;
            }
            job.mark_cancelled();
        }

        if let Some(mut pending) = self.inner.pending.lock().remove(job_id) {
            let honoured = pending.cancel();
            debug!(job_id = %job_id, honoured, "Requested backend cancellation");
        }
        self.inner.backlog.lock().retain(|queued| queued != job_id);
        info!(job_id = %job_id, "Job cancelled");
        true
    }

    /// Jobs sorted by descending priority, then creation time
    pub fn list(&self, tab_name: Option<&str>, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .jobs
            .iter()
            .filter(|job| tab_name.map_or(true, |tab| job.tab_name == tab))
            .filter(|job| status.map_or(true, |s| job.status == s))
            .map(|job| job.value().clone())
            .collect();
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        jobs
    }

    /// Remove terminal jobs, optionally only one caller's
    pub fn clear_completed(&self, tab_name: Option<&str>) -> usize {
        let doomed: Vec<JobId> = self
            .inner
            .jobs
            .iter()
            .filter(|job| job.status.is_terminal())
            .filter(|job| tab_name.map_or(true, |tab| job.tab_name == tab))
            .map(|job| job.id.clone())
            .collect();

        for job_id in &doomed {
            self.inner.jobs.remove(job_id);
            self.inner.pending.lock().remove(job_id);
            let mut threads = self.inner.threads.lock();
            if threads.get(job_id).map_or(false, |h| h.is_finished()) {
                threads.remove(job_id);
            }
        }
        info!(removed = doomed.len(), "Cleared completed jobs");
        doomed.len()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            backlog: self.inner.backlog.lock().len(),
            backend: self.inner.backend.as_ref().map(|b| b.name().to_string()),
            backend_available: self.available_backend().is_some(),
            max_concurrent: self.inner.config.max_concurrent_jobs,
            ..Default::default()
        };
        for job in self.inner.jobs.iter() {
            stats.total_jobs += 1;
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
            *stats.tab_counts.entry(job.tab_name.clone()).or_insert(0) += 1;
        }
        stats
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.inner.config
    }

    /// Refuse new jobs, cancel the backlog and wait up to `timeout` for local threads
    pub fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;

        let abandoned: Vec<JobId> = self.inner.backlog.lock().drain(..).collect();
        for job_id in &abandoned {
            if let Some(mut job) = self.inner.jobs.get_mut(job_id) {
                if job.status == JobStatus::Queued {
                    job.mark_cancelled();
                }
            }
        }
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "Cancelled backlog jobs at shutdown");
        }

        let mut report = ShutdownReport::default();
        loop {
            let finished: Vec<(JobId, JoinHandle<()>)> = {
                let mut threads = self.inner.threads.lock();
                let done: Vec<JobId> = threads
                    .iter()
                    .filter(|(_, h)| h.is_finished())
                    .map(|(id, _)| id.clone())
                    .collect();
                done.into_iter()
                    .filter_map(|id| threads.remove(&id).map(|h| (id, h)))
                    .collect()
            };
            for (job_id, handle) in finished {
                if handle.join().is_err() {
                    warn!(job_id = %job_id, "Job thread panicked");
                }
                report.joined.push(job_id);
            }

            let remaining = self.inner.threads.lock().len();
            let now = Instant::now();
            if remaining == 0 || now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }

        report.still_running = self.inner.threads.lock().keys().cloned().collect();
        report
            .still_running
            .extend(self.inner.pending.lock().keys().cloned());

        if let Some(backend) = &self.inner.backend {
            backend.shutdown(deadline.saturating_duration_since(Instant::now()));
        }
        info!(
            joined = report.joined.len(),
            still_running = report.still_running.len(),
            "Job queue shut down"
        );
        report
    }
}

const PANICKED_ERROR: &str = "Job thread panicked";

/// Frees a local job's slot and starts the next backlog job when the run
/// ends, including by panic
struct LocalRun<'a> {
    queue: &'a JobQueue,
    job_id: &'a str,
    permit: Option<ExecutionPermit>,
}

impl Drop for LocalRun<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(job_id = %self.job_id, "Job thread panicked");
            self.queue
                .resolve(self.job_id, Err(PANICKED_ERROR.to_string()));
        }
        drop(self.permit.take());
        self.queue.drain_backlog();
    }
}

fn short_id(job_id: &str) -> &str {
    job_id.get(..8).unwrap_or(job_id)
}
