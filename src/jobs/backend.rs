//! Distributed execution seam for the job queue.
//!
//! A backend accepts a job with its resource profile and hands back a
//! [`PendingResult`] the queue polls lazily; nothing is pushed back.

use crate::core::errors::{ForgeError, Result};
use crate::jobs::model::{JobFn, JobId, JobKwargs, JobType};
use crate::jobs::profiles::ResourceProfile;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// `Err` carries the failure message
pub type JobOutcome = std::result::Result<Value, String>;

/// What a backend receives for one job
pub struct DispatchRequest {
    pub job_id: JobId,
    pub job_type: JobType,
    pub profile: ResourceProfile,
    pub function: Arc<dyn JobFn>,
    pub args: Vec<Value>,
    pub kwargs: JobKwargs,
}

/// Handle to a computation running on a backend
pub trait PendingResult: Send {
    /// Take the outcome if it is ready; never blocks
    fn try_take(&mut self) -> Option<JobOutcome>;

    /// Block up to `timeout` for the outcome
    fn wait(&mut self, timeout: Duration) -> Option<JobOutcome>;

    /// Ask the backend to drop the job. Returns whether it could still be stopped.
    fn cancel(&mut self) -> bool;
}

pub trait DistributedBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Jobs fall back to local threads while this is false
    fn is_available(&self) -> bool;

    fn dispatch(&self, request: DispatchRequest) -> Result<Box<dyn PendingResult>>;

    /// Stop accepting work and release resources
    fn shutdown(&self, _timeout: Duration) {}
}

/// Backend running jobs on a dedicated multi-threaded tokio runtime.
///
/// Each job holds permits worth its profile's CPU share (in milli-CPUs)
/// against a fixed budget while it runs on the blocking pool, so heavy
/// job types admit fewer peers.
pub struct TokioBackend {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    cpu_budget: Arc<Semaphore>,
    budget_millis: u32,
    available: AtomicBool,
}

impl TokioBackend {
    /// `cpu_cores` is the total CPU budget shared by running jobs
    pub fn new(worker_threads: usize, cpu_cores: f64) -> Result<Self> {
        if worker_threads == 0 {
            return Err(ForgeError::configuration(
                "worker_threads must be greater than 0",
            ));
        }
        let budget_millis = (cpu_cores * 1000.0).round();
        if !budget_millis.is_finite() || budget_millis < 1.0 {
            return Err(ForgeError::configuration("cpu_cores must be positive"));
        }
        let budget_millis = budget_millis.min(Semaphore::MAX_PERMITS as f64) as u32;

        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("taskforge-backend")
            .enable_time()
            .build()
            .map_err(|e| ForgeError::backend("tokio", e.to_string()))?;
        let handle = runtime.handle().clone();

        info!(worker_threads, cpu_cores, "Tokio job backend started");
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            cpu_budget: Arc::new(Semaphore::new(budget_millis as usize)),
            budget_millis,
            available: AtomicBool::new(true),
        })
    }

    /// One worker and one core of budget per available CPU
    pub fn with_defaults() -> Result<Self> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(cores, cores as f64)
    }

    /// Milli-CPUs not currently held by running jobs
    pub fn free_cpu_millis(&self) -> usize {
        self.cpu_budget.available_permits()
    }
}

impl DistributedBackend for TokioBackend {
    fn name(&self) -> &str {
        "tokio"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn dispatch(&self, request: DispatchRequest) -> Result<Box<dyn PendingResult>> {
        if !self.is_available() {
            return Err(ForgeError::backend("tokio", "backend is shut down"));
        }

        let DispatchRequest {
            job_id,
            profile,
            function,
            args,
            kwargs,
            ..
        } = request;
        let permits = profile.cpu_millis().clamp(1, self.budget_millis);
        let budget = Arc::clone(&self.cpu_budget);
        let started = Arc::new(AtomicBool::new(false));
        let started_flag = Arc::clone(&started);

        debug!(job_id = %job_id, cpu_millis = permits, "Dispatching job to tokio backend");
        let (sender, receiver) = mpsc::channel();
        let task = self.handle.spawn(async move {
            let outcome =
                run_with_budget(budget, permits, started_flag, function, args, kwargs).await;
            // The receiver is gone once the queue dropped or cancelled the job
            let _ = sender.send(outcome);
        });

        Ok(Box::new(TokioPending {
            receiver: Some(receiver),
            task,
            started,
        }))
    }

    fn shutdown(&self, timeout: Duration) {
        self.available.store(false, Ordering::SeqCst);
        if let Some(runtime) = self.runtime.lock().take() {
            stop_runtime(runtime, timeout);
            info!("Tokio job backend stopped");
        }
    }
}

impl Drop for TokioBackend {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            stop_runtime(runtime, Duration::ZERO);
        }
    }
}

/// Blocking shutdown is not allowed on a thread that is itself driving a runtime
fn stop_runtime(runtime: Runtime, timeout: Duration) {
    if Handle::try_current().is_ok() {
        runtime.shutdown_background();
    } else {
        runtime.shutdown_timeout(timeout);
    }
}

async fn run_with_budget(
    budget: Arc<Semaphore>,
    permits: u32,
    started: Arc<AtomicBool>,
    function: Arc<dyn JobFn>,
    args: Vec<Value>,
    kwargs: JobKwargs,
) -> JobOutcome {
    let _permit = match budget.acquire_many_owned(permits).await {
        Ok(permit) => permit,
        Err(e) => return Err(e.to_string()),
    };
    started.store(true, Ordering::SeqCst);
    match tokio::task::spawn_blocking(move || function.call(&args, &kwargs)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("Job panicked: {}", e)),
    }
}

/// Outcome handed back over a channel so callers never enter the runtime,
/// whether or not they run inside one themselves
struct TokioPending {
    receiver: Option<Receiver<JobOutcome>>,
    task: JoinHandle<()>,
    started: Arc<AtomicBool>,
}

const LOST_OUTCOME: &str = "Job was dropped by the backend before it finished";

impl PendingResult for TokioPending {
    fn try_take(&mut self) -> Option<JobOutcome> {
        let outcome = match self.receiver.as_ref()?.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => Err(LOST_OUTCOME.to_string()),
        };
        self.receiver = None;
        Some(outcome)
    }

    fn wait(&mut self, timeout: Duration) -> Option<JobOutcome> {
        let outcome = match self.receiver.as_ref()?.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => Err(LOST_OUTCOME.to_string()),
        };
        self.receiver = None;
        Some(outcome)
    }

    fn cancel(&mut self) -> bool {
        if self.receiver.take().is_none() {
            return false;
        }
        self.task.abort();
        let stoppable = !self.started.load(Ordering::SeqCst);
        if !stoppable {
            warn!("Job already running on the blocking pool; it will finish in the background");
        }
        stoppable
    }
}
