use crate::core::limits::ExecutionPermit;
use crate::tasks::model::{Artifact, Task, TaskId};
use crate::tasks::registry::{Kwargs, WorkFn};
use crate::tasks::store::TaskStore;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

/// Cooperative stop flag shared between the store and a running work function
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Handle a work function uses to observe cancellation and report progress.
///
/// Every write is scoped to the run that created the context: once the task
/// has been retried, calls from an older run are ignored and return `false`.
pub struct TaskContext {
    task_id: TaskId,
    generation: u64,
    stop: CancellationToken,
    store: TaskStore,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        generation: u64,
        stop: CancellationToken,
        store: TaskStore,
    ) -> Self {
        Self {
            task_id,
            generation,
            stop,
            store,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn stop_flag(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// `Err` once `stop` was requested; meant for `?` between steps
    pub fn check_cancelled(&self) -> anyhow::Result<()> {
        if self.stop.is_cancelled() {
            anyhow::bail!("Task cancelled");
        }
        Ok(())
    }

    /// Current copy of the task
    pub fn snapshot(&self) -> Option<Task> {
        self.store.get(&self.task_id)
    }

    /// Edit the live task in place. Nothing is written to disk until
    /// [`persist`](Self::persist) or another persisting call.
    pub fn update<F>(&self, mutate: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        self.store
            .apply_to_run(&self.task_id, self.generation, false, mutate)
    }

    /// Flush the whole task map to disk now
    pub fn persist(&self) {
        self.store.persist_now();
    }

    /// Set progress (clamped) and optionally the step label, then persist
    pub fn set_progress(&self, progress: f64, step: Option<&str>) -> bool {
        self.store
            .apply_to_run(&self.task_id, self.generation, true, |task| {
                task.set_progress(progress);
                if let Some(step) = step {
                    task.current_step = step.to_string();
                }
            })
    }

    pub fn set_steps(&self, completed_steps: u32, total_steps: u32) -> bool {
        self.store
            .apply_to_run(&self.task_id, self.generation, true, |task| {
                task.completed_steps = completed_steps;
                task.total_steps = total_steps;
            })
    }

    /// Timestamped log line, persisted
    pub fn log(&self, message: &str) -> bool {
        let cap = self.store.max_log_entries();
        self.store
            .apply_to_run(&self.task_id, self.generation, true, |task| {
                task.push_timestamped_log(message, cap);
            })
    }

    pub fn add_artifact(&self, artifact: Artifact) -> bool {
        self.store
            .apply_to_run(&self.task_id, self.generation, true, |task| {
                task.artifacts.push(artifact);
            })
    }
}

/// Everything one run needs, moved into its thread
pub(crate) struct Launch {
    pub task_id: TaskId,
    pub generation: u64,
    pub stop: CancellationToken,
    pub work: Arc<dyn WorkFn>,
    pub kwargs: Kwargs,
    pub permit: ExecutionPermit,
}

/// Run the work function on its own named OS thread
pub(crate) fn spawn(store: TaskStore, launch: Launch) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("task-{}", launch.task_id))
        .spawn(move || execute(store, launch))
}

fn execute(store: TaskStore, launch: Launch) {
    let Launch {
        task_id,
        generation,
        stop,
        work,
        kwargs,
        permit,
    } = launch;

    info!(task_id = %task_id, generation, "Task thread started");
    let ctx = TaskContext::new(task_id, generation, stop, store.clone());
    let outcome = work.run(&ctx, &kwargs);
    store.finish_run(&ctx.task_id, generation, outcome);

    debug!(
        task_id = %ctx.task_id,
        elapsed_ms = permit.elapsed().as_millis() as u64,
        "Task thread finished"
    );
    drop(permit);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_clones_share_flag() {
        let token = CancellationToken::new();
        let seen_by_worker = token.clone();
        assert!(!seen_by_worker.is_cancelled());
        token.cancel();
        assert!(seen_by_worker.is_cancelled());
    }
}
