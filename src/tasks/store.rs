//! The task store: authoritative in-memory task map mirrored to disk.
//!
//! One mutex guards both the map and the whole-file rewrite, so readers never
//! observe a torn snapshot. The lock is never held while a work function runs.

use crate::config::TaskStoreConfig;
use crate::core::errors::{ForgeError, Result};
use crate::core::limits::{ConcurrencyLimiter, ConcurrencyLimits, LimiterStats};
use crate::tasks::model::{
    meta, Artifact, Task, TaskId, TaskState, CANCELLED_LOG, DEAD_THREAD_ERROR, INTERRUPTED_ERROR,
};
use crate::tasks::persistence::{JsonStateFile, MemoryState, StatePersistence, StateSnapshot};
use crate::tasks::recovery::{CrashRecovery, RecoveryStats, RetryOptions};
use crate::tasks::registry::{Kwargs, WorkFn, WorkRegistry};
use crate::tasks::runner::{self, CancellationToken, Launch};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bookkeeping kept next to each task, never persisted
struct TaskSlot {
    task: Task,
    seq: u64,
    stop: CancellationToken,
    /// Bumped by every start; runs tagged with an older value are stale
    generation: u64,
    thread: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct StoreState {
    slots: HashMap<TaskId, TaskSlot>,
    next_seq: u64,
}

impl StoreState {
    fn insert(&mut self, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(
            task.id.clone(),
            TaskSlot {
                task,
                seq,
                stop: CancellationToken::new(),
                generation: 0,
                thread: None,
            },
        );
    }

    fn slot_mut(&mut self, task_id: &str) -> Result<&mut TaskSlot> {
        self.slots
            .get_mut(task_id)
            .ok_or_else(|| ForgeError::TaskNotFound(task_id.to_string()))
    }

    /// Slots in creation order
    fn ordered(&self) -> Vec<&TaskSlot> {
        let mut slots: Vec<&TaskSlot> = self.slots.values().collect();
        slots.sort_by_key(|slot| slot.seq);
        slots
    }
}

struct StoreInner {
    config: TaskStoreConfig,
    state: Mutex<StoreState>,
    persistence: Box<dyn StatePersistence>,
    registry: WorkRegistry,
    limiter: Arc<ConcurrencyLimiter>,
    durable: AtomicBool,
    last_persist_error: Mutex<Option<String>>,
    shutting_down: AtomicBool,
    recovery_stats: Mutex<RecoveryStats>,
}

/// Outcome of [`TaskStore::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Tasks whose threads were joined
    pub joined: Vec<TaskId>,
    /// Tasks whose threads were still running at the deadline
    pub still_running: Vec<TaskId>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.still_running.is_empty()
    }
}

/// Thread-safe task store. Clones share the same state.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<StoreInner>,
}

impl TaskStore {
    /// Open the store backed by `config.state_file`.
    ///
    /// Loads the file, marks tasks that were `Running` as interrupted,
    /// resumes them when `auto_recover` is set, then sweeps stuck tasks.
    pub fn open(config: TaskStoreConfig, registry: WorkRegistry) -> Result<Self> {
        let persistence = Box::new(JsonStateFile::new(&config.state_file));
        Self::open_with(config, registry, persistence)
    }

    /// Store whose state only lives in memory
    pub fn in_memory(config: TaskStoreConfig, registry: WorkRegistry) -> Result<Self> {
        Self::open_with(config, registry, Box::new(MemoryState::new()))
    }

    pub fn open_with(
        config: TaskStoreConfig,
        registry: WorkRegistry,
        persistence: Box<dyn StatePersistence>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = ConcurrencyLimiter::new(
            "tasks",
            ConcurrencyLimits {
                max_concurrent: config.max_running_tasks,
            },
        )?;

        let store = Self {
            inner: Arc::new(StoreInner {
                config,
                state: Mutex::new(StoreState::default()),
                persistence,
                registry,
                limiter,
                durable: AtomicBool::new(true),
                last_persist_error: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                recovery_stats: Mutex::new(RecoveryStats::default()),
            }),
        };

        let interrupted = store.load_state();
        if store.inner.config.auto_recover && interrupted > 0 {
            let stats = CrashRecovery::new(&store).recover();
            *store.inner.recovery_stats.lock() = stats;
        }
        let stuck = store.cleanup_stuck(store.inner.config.stuck_task_timeout);

        info!(
            location = %store.inner.persistence.describe(),
            tasks = store.inner.state.lock().slots.len(),
            interrupted,
            stuck,
            "Task store opened"
        );
        Ok(store)
    }

    /// Read the snapshot and fail every task that was mid-run. Returns how many were.
    fn load_state(&self) -> usize {
        let snapshot = match self.inner.persistence.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return 0,
            Err(e @ ForgeError::Serialization(_)) => {
                match self.inner.persistence.set_aside() {
                    Ok(Some(moved)) => error!(
                        location = %self.inner.persistence.describe(),
                        moved_to = %moved,
                        "Task state is unreadable, moved aside and starting empty: {}", e
                    ),
                    Ok(None) => warn!(
                        location = %self.inner.persistence.describe(),
                        "Task state is unreadable, starting empty: {}", e
                    ),
                    Err(move_err) => error!(
                        location = %self.inner.persistence.describe(),
                        "Task state is unreadable and could not be moved aside: {}; {}", e, move_err
                    ),
                }
                return 0;
            }
            Err(e) => {
                warn!(
                    location = %self.inner.persistence.describe(),
                    "Could not load task state, starting empty: {}", e
                );
                return 0;
            }
        };

        let mut state = self.inner.state.lock();
        let mut interrupted = 0;
        for mut task in snapshot.tasks {
            if task.state == TaskState::Running {
                task.state = TaskState::Failed;
                task.error = Some(INTERRUPTED_ERROR.to_string());
                interrupted += 1;
                warn!(task_id = %task.id, "Task was running when the process stopped");
            }
            task.enforce_bounds(self.inner.config.max_log_entries);
            state.insert(task);
        }
        if interrupted > 0 {
            self.persist_locked(&state);
        }
        interrupted
    }

    /// Rewrite the whole state file. Failures are logged and recorded, never returned.
    fn persist_locked(&self, state: &StoreState) {
        let snapshot = StateSnapshot::capture(
            state.ordered().into_iter().map(|slot| &slot.task),
            self.inner.config.persisted_log_entries,
        );
        match self.inner.persistence.save(&snapshot) {
            Ok(()) => {
                self.inner.durable.store(true, Ordering::SeqCst);
                *self.inner.last_persist_error.lock() = None;
            }
            Err(e) => {
                warn!(
                    location = %self.inner.persistence.describe(),
                    "Could not persist task state: {}", e
                );
                self.inner.durable.store(false, Ordering::SeqCst);
                *self.inner.last_persist_error.lock() = Some(e.to_string());
            }
        }
    }

    pub(crate) fn persist_now(&self) {
        let state = self.inner.state.lock();
        self.persist_locked(&state);
    }

    /// Mutate one task and persist
    fn modify<R>(&self, task_id: &str, mutate: impl FnOnce(&mut Task) -> R) -> Result<R> {
        let mut state = self.inner.state.lock();
        let slot = state.slot_mut(task_id)?;
        let out = mutate(&mut slot.task);
        slot.task.enforce_bounds(self.inner.config.max_log_entries);
        self.persist_locked(&state);
        Ok(out)
    }

    /// Create a `Pending` task with a fresh id and stop flag
    pub fn create(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Task {
        let task = Task::new(Uuid::new_v4().to_string(), name, description, metadata);
        let mut state = self.inner.state.lock();
        state.insert(task.clone());
        self.persist_locked(&state);
        info!(task_id = %task.id, name = %task.name, "Task created");
        task
    }

    /// Start a `Pending` task with the work function registered under `target`
    pub fn start(&self, task_id: &str, target: &str, kwargs: Kwargs) -> Result<()> {
        let work = self
            .inner
            .registry
            .get(target)
            .ok_or_else(|| ForgeError::UnknownWorkFunction(target.to_string()))?;
        self.start_with(task_id, target, work, kwargs)
    }

    /// Start a `Pending` task with an explicit work function.
    ///
    /// `target` is still recorded for recovery; it only resolves after a
    /// restart if the same key is registered then.
    pub fn start_with(
        &self,
        task_id: &str,
        target: &str,
        work: Arc<dyn WorkFn>,
        kwargs: Kwargs,
    ) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ForgeError::ShuttingDown);
        }
        let permit = self.inner.limiter.try_acquire()?;

        let (generation, stop) = {
            let mut state = self.inner.state.lock();
            let slot = state.slot_mut(task_id)?;
            if slot.task.state != TaskState::Pending {
                return Err(ForgeError::invalid_transition(
                    task_id,
                    slot.task.state,
                    "start",
                ));
            }
            // A retried task still holds the handle of its previous run
            if let Some(previous) = slot.thread.take() {
                if previous.is_finished() {
                    let _ = previous.join();
                } else {
                    debug!(task_id = %task_id, "Detaching thread of an earlier run");
                }
            }

            let default_max = self.inner.config.default_max_recovery_attempts;
            let task = &mut slot.task;
            task.set_meta(meta::BACKGROUND_TARGET, target);
            task.set_meta(meta::BACKGROUND_KWARGS, Value::Object(kwargs.clone()));
            if !task.metadata.contains_key(meta::RECOVERY_ATTEMPTS) {
                task.set_meta(meta::RECOVERY_ATTEMPTS, 0);
            }
            if !task.metadata.contains_key(meta::MAX_RECOVERY_ATTEMPTS) {
                task.set_meta(meta::MAX_RECOVERY_ATTEMPTS, default_max);
            }
            task.state = TaskState::Running;
            task.error = None;
            task.started_at = Some(Utc::now());
            task.completed_at = None;

            slot.generation += 1;
            let launched = (slot.generation, slot.stop.clone());
            self.persist_locked(&state);
            launched
        };

        let launch = Launch {
            task_id: task_id.to_string(),
            generation,
            stop,
            work,
            kwargs,
            permit,
        };
        match runner::spawn(self.clone(), launch) {
            Ok(handle) => {
                let mut state = self.inner.state.lock();
                if let Some(slot) = state.slots.get_mut(task_id) {
                    if slot.generation == generation {
                        slot.thread = Some(handle);
                    }
                }
                info!(task_id = %task_id, target = %target, "Task started");
                Ok(())
            }
            Err(e) => {
                error!(task_id = %task_id, "Could not spawn task thread: {}", e);
                let message = format!("Could not spawn task thread: {}", e);
                self.modify(task_id, |task| {
                    task.state = TaskState::Failed;
                    task.error = Some(message);
                    task.completed_at = Some(Utc::now());
                })?;
                Err(ForgeError::io("spawn task thread", e))
            }
        }
    }

    /// Apply a work function's edit if `generation` is still the current run
    pub(crate) fn apply_to_run<F>(
        &self,
        task_id: &str,
        generation: u64,
        persist: bool,
        mutate: F,
    ) -> bool
    where
        F: FnOnce(&mut Task),
    {
        let mut state = self.inner.state.lock();
        let Some(slot) = state.slots.get_mut(task_id) else {
            return false;
        };
        if slot.generation != generation {
            debug!(task_id = %task_id, generation, "Ignoring update from a stale run");
            return false;
        }
        mutate(&mut slot.task);
        slot.task.enforce_bounds(self.inner.config.max_log_entries);
        if persist {
            self.persist_locked(&state);
        }
        true
    }

    /// Record the work function's outcome. A state made terminal meanwhile
    /// (stop, stuck sweep) is kept; the outcome only goes to the log.
    pub(crate) fn finish_run(
        &self,
        task_id: &str,
        generation: u64,
        outcome: anyhow::Result<Value>,
    ) {
        let cap = self.inner.config.max_log_entries;
        let mut state = self.inner.state.lock();
        let Some(slot) = state.slots.get_mut(task_id) else {
            debug!(task_id = %task_id, "Task was cleared before its run finished");
            return;
        };
        if slot.generation != generation {
            debug!(task_id = %task_id, generation, "Discarding outcome of a stale run");
            return;
        }

        let task = &mut slot.task;
        let still_running = task.state == TaskState::Running;
        match outcome {
            Ok(value) if still_running => {
                task.result = Some(value);
                task.error = None;
                task.state = TaskState::Completed;
                task.completed_at = Some(Utc::now());
                task.progress = 1.0;
                info!(task_id = %task_id, "Task completed successfully");
            }
            Err(e) if still_running => {
                let message = e.to_string();
                let chain = format!("{:?}", e);
                task.state = TaskState::Failed;
                task.error = Some(message.clone());
                task.completed_at = Some(Utc::now());
                task.push_log(format!("ERROR: {}", message), cap);
                if chain != message {
                    task.push_log(chain, cap);
                }
                error!(task_id = %task_id, "Task failed: {}", message);
            }
            Ok(_) => {
                let note = format!("Run finished after task became {}; result discarded", task.state);
                task.push_timestamped_log(&note, cap);
                debug!(task_id = %task_id, state = %task.state, "Run finished after terminal state");
            }
            Err(e) => {
                let note = format!("Run ended after task became {}: {}", task.state, e);
                task.push_timestamped_log(&note, cap);
                debug!(task_id = %task_id, state = %task.state, "Run errored after terminal state");
            }
        }
        self.persist_locked(&state);
    }

    /// Clamp and record progress. Empty `step` leaves the label alone.
    pub fn update_progress(
        &self,
        task_id: &str,
        progress: f64,
        step: Option<&str>,
        completed_steps: Option<u32>,
        total_steps: Option<u32>,
    ) -> Result<()> {
        self.modify(task_id, |task| {
            task.set_progress(progress);
            if let Some(step) = step.filter(|s| !s.is_empty()) {
                task.current_step = step.to_string();
            }
            if let Some(completed) = completed_steps {
                task.completed_steps = completed;
            }
            if let Some(total) = total_steps {
                task.total_steps = total;
            }
        })
    }

    /// Append `[HH:MM:SS] message`
    pub fn append_log(&self, task_id: &str, message: &str) -> Result<()> {
        let cap = self.inner.config.max_log_entries;
        self.modify(task_id, |task| task.push_timestamped_log(message, cap))
    }

    pub fn add_artifact(&self, task_id: &str, artifact: Artifact) -> Result<()> {
        self.modify(task_id, |task| task.artifacts.push(artifact))
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.inner
            .state
            .lock()
            .slots
            .get(task_id)
            .map(|slot| slot.task.clone())
    }

    /// Every task, in creation order
    pub fn list_all(&self) -> Vec<Task> {
        self.inner
            .state
            .lock()
            .ordered()
            .into_iter()
            .map(|slot| slot.task.clone())
            .collect()
    }

    /// Running tasks. A task whose thread has already exited is failed first.
    pub fn list_running(&self) -> Vec<Task> {
        let mut state = self.inner.state.lock();
        let mut healed = 0;
        for slot in state.slots.values_mut() {
            let dead = slot.task.state == TaskState::Running
                && slot.thread.as_ref().map_or(false, |h| h.is_finished());
            if !dead {
                continue;
            }
            warn!(task_id = %slot.task.id, "Task marked as running but its thread is dead");
            slot.task.state = TaskState::Failed;
            slot.task.error = Some(DEAD_THREAD_ERROR.to_string());
            slot.task.completed_at = Some(Utc::now());
            if let Some(handle) = slot.thread.take() {
                let _ = handle.join();
            }
            healed += 1;
        }
        if healed > 0 {
            self.persist_locked(&state);
        }

        state
            .ordered()
            .into_iter()
            .filter(|slot| slot.task.state == TaskState::Running)
            .map(|slot| slot.task.clone())
            .collect()
    }

    /// Raise the stop flag and mark the task `Cancelled`.
    ///
    /// Cooperative only: the thread keeps running until the work function
    /// notices the flag.
    pub fn stop(&self, task_id: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        let slot = state.slot_mut(task_id)?;
        if slot.task.state.is_terminal() {
            return Err(ForgeError::invalid_transition(
                task_id,
                slot.task.state,
                "stop",
            ));
        }
        slot.stop.cancel();
        slot.task.state = TaskState::Cancelled;
        slot.task.completed_at = Some(Utc::now());
        slot.task
            .push_log(CANCELLED_LOG, self.inner.config.max_log_entries);
        self.persist_locked(&state);
        info!(task_id = %task_id, "Requested stop for task");
        Ok(())
    }

    /// Manually re-run a `Failed` or `Cancelled` task
    pub fn retry(&self, task_id: &str, options: RetryOptions) -> Result<()> {
        CrashRecovery::new(self).retry(task_id, options)
    }

    /// Drop every terminal task along with its thread handle and stop flag
    pub fn clear_completed(&self) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.slots.len();
        state.slots.retain(|_, slot| !slot.task.state.is_terminal());
        let removed = before - state.slots.len();
        self.persist_locked(&state);
        info!(removed, "Cleared completed tasks");
        removed
    }

    /// Fail `Pending`/`Running` tasks still at zero progress `timeout` after starting
    pub fn cleanup_stuck(&self, timeout: Duration) -> usize {
        let Ok(limit) = chrono::Duration::from_std(timeout) else {
            return 0;
        };
        let message = format!("Task timeout - no progress after {}", describe_timeout(timeout));
        let now = Utc::now();

        let mut state = self.inner.state.lock();
        let mut cleaned = 0;
        for slot in state.slots.values_mut() {
            let task = &mut slot.task;
            if !matches!(task.state, TaskState::Running | TaskState::Pending) {
                continue;
            }
            let Some(started) = task.started_at else {
                continue;
            };
            if task.progress == 0.0 && now - started > limit {
                slot.stop.cancel();
                task.state = TaskState::Failed;
                task.error = Some(message.clone());
                task.completed_at = Some(now);
                cleaned += 1;
                warn!(task_id = %task.id, "Cleaned up stuck task");
            }
        }
        if cleaned > 0 {
            self.persist_locked(&state);
            info!(cleaned, "Cleaned up stuck tasks");
        }
        cleaned
    }

    /// Reset a `Failed`/`Cancelled` task to `Pending` for another run.
    /// Returns the task as it was before the reset and as it is now.
    pub(crate) fn prepare_rerun(
        &self,
        task_id: &str,
        adjust: impl FnOnce(&mut Task),
    ) -> Result<(Task, Task)> {
        let mut state = self.inner.state.lock();
        let slot = state.slot_mut(task_id)?;
        if !slot.task.state.is_retryable() {
            return Err(ForgeError::invalid_transition(
                task_id,
                slot.task.state,
                "retry",
            ));
        }
        let previous = slot.task.clone();
        slot.stop = CancellationToken::new();
        let task = &mut slot.task;
        task.state = TaskState::Pending;
        task.error = None;
        task.result = None;
        task.completed_at = None;
        task.progress = 0.0;
        task.completed_steps = 0;
        task.current_step.clear();
        adjust(task);
        let prepared = task.clone();
        self.persist_locked(&state);
        Ok((previous, prepared))
    }

    /// Reset a retryable task and start it again.
    ///
    /// When the start is refused (running ceiling, shutdown) the task goes
    /// back to its previous state with the refusal appended to its log.
    pub(crate) fn rerun(
        &self,
        task_id: &str,
        target: &str,
        work: Arc<dyn WorkFn>,
        adjust: impl FnOnce(&mut Task),
    ) -> Result<()> {
        let (previous, prepared) = self.prepare_rerun(task_id, adjust)?;
        let started = self.start_with(task_id, target, work, prepared.background_kwargs());
        if let Err(e) = &started {
            let cap = self.inner.config.max_log_entries;
            let mut state = self.inner.state.lock();
            let restored = match state.slots.get_mut(task_id) {
                Some(slot) if slot.task.state == TaskState::Pending => {
                    slot.task = previous;
                    slot.task
                        .push_timestamped_log(&format!("Restart refused: {}", e), cap);
                    true
                }
                _ => false,
            };
            if restored {
                self.persist_locked(&state);
                warn!(task_id = %task_id, "Restart refused, task restored: {}", e);
            }
        }
        started
    }

    /// Apply metadata edits that must persist even if the retry then fails
    pub(crate) fn edit_task<R>(
        &self,
        task_id: &str,
        edit: impl FnOnce(&mut Task) -> Result<R>,
    ) -> Result<R> {
        self.modify(task_id, edit)?
    }

    /// Refuse new starts, then wait up to `timeout` for task threads to exit.
    ///
    /// Tasks still running at the deadline stay `Running` on disk and are
    /// recovered as interrupted on the next open.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        loop {
            let mut finished = Vec::new();
            let mut pending = Vec::new();
            {
                let mut state = self.inner.state.lock();
                for slot in state.slots.values_mut() {
                    match slot.thread.as_ref().map(JoinHandle::is_finished) {
                        Some(true) => {
                            if let Some(handle) = slot.thread.take() {
                                finished.push((slot.task.id.clone(), handle));
                            }
                        }
                        Some(false) => pending.push(slot.task.id.clone()),
                        None => {}
                    }
                }
            }
            for (task_id, handle) in finished {
                if handle.join().is_err() {
                    warn!(task_id = %task_id, "Task thread panicked");
                }
                report.joined.push(task_id);
            }

            let now = Instant::now();
            if pending.is_empty() || now >= deadline {
                report.still_running = pending;
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }

        self.persist_now();
        if report.is_clean() {
            info!(joined = report.joined.len(), "Task store shut down");
        } else {
            warn!(
                joined = report.joined.len(),
                still_running = report.still_running.len(),
                "Task store shut down with threads still running"
            );
        }
        report
    }

    /// False while the most recent save failed
    pub fn is_durable(&self) -> bool {
        self.inner.durable.load(Ordering::SeqCst)
    }

    pub fn last_persist_error(&self) -> Option<String> {
        self.inner.last_persist_error.lock().clone()
    }

    /// Result of the recovery pass run by `open`
    pub fn recovery_stats(&self) -> RecoveryStats {
        self.inner.recovery_stats.lock().clone()
    }

    pub fn limiter_stats(&self) -> LimiterStats {
        self.inner.limiter.stats()
    }

    pub fn registry(&self) -> &WorkRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &TaskStoreConfig {
        &self.inner.config
    }

    pub(crate) fn max_log_entries(&self) -> usize {
        self.inner.config.max_log_entries
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }
}

fn describe_timeout(timeout: Duration) -> String {
    let secs = timeout.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{} seconds", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::runner::TaskContext;
    use serde_json::json;

    fn memory_store() -> TaskStore {
        TaskStore::in_memory(TaskStoreConfig::default(), WorkRegistry::new()).unwrap()
    }

    fn wait_terminal(store: &TaskStore, id: &str) -> Task {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let task = store.get(id).unwrap();
            if task.state.is_terminal() || Instant::now() > deadline {
                return task;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_create_lists_in_order() {
        let store = memory_store();
        let a = store.create("a", "", Map::new());
        let b = store.create("b", "", Map::new());
        assert_ne!(a.id, b.id);
        let names: Vec<_> = store.list_all().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(store.is_durable());
    }

    #[test]
    fn test_unknown_ids_are_errors() {
        let store = memory_store();
        assert!(matches!(
            store.append_log("nope", "x"),
            Err(ForgeError::TaskNotFound(_))
        ));
        assert!(matches!(store.stop("nope"), Err(ForgeError::TaskNotFound(_))));
        assert!(store.get("nope").is_none());
    }

    #[test]
    fn test_start_requires_pending_and_known_target() {
        let store = memory_store();
        store
            .registry()
            .register("echo", |_ctx: &TaskContext, kwargs: &Kwargs| {
                Ok(Value::Object(kwargs.clone()))
            });
        let task = store.create("demo", "", Map::new());

        assert!(matches!(
            store.start(&task.id, "missing", Kwargs::new()),
            Err(ForgeError::UnknownWorkFunction(_))
        ));

        let mut kwargs = Kwargs::new();
        kwargs.insert("n".into(), json!(3));
        store.start(&task.id, "echo", kwargs).unwrap();
        let done = wait_terminal(&store, &task.id);
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.result, Some(json!({"n": 3})));
        assert_eq!(done.background_target(), Some("echo"));
        assert_eq!(done.metadata[meta::MAX_RECOVERY_ATTEMPTS], json!(1));

        let err = store.start(&task.id, "echo", Kwargs::new()).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidTransition { .. }));
    }

    #[test]
    fn test_stuck_sweep_only_hits_zero_progress() {
        let store = memory_store();
        let stuck = store.create("stuck", "", Map::new());
        let moving = store.create("moving", "", Map::new());
        {
            let mut state = store.inner.state.lock();
            for id in [&stuck.id, &moving.id] {
                let slot = state.slots.get_mut(id.as_str()).unwrap();
                slot.task.state = TaskState::Running;
                slot.task.started_at = Some(Utc::now() - chrono::Duration::minutes(10));
            }
            state.slots.get_mut(moving.id.as_str()).unwrap().task.progress = 0.4;
        }

        assert_eq!(store.cleanup_stuck(Duration::from_secs(300)), 1);
        let failed = store.get(&stuck.id).unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(
            failed.error.as_deref(),
            Some("Task timeout - no progress after 5 minutes")
        );
        assert_eq!(store.get(&moving.id).unwrap().state, TaskState::Running);
    }

    #[test]
    fn test_running_ceiling_rejects_start() {
        let config = TaskStoreConfig {
            max_running_tasks: Some(1),
            ..Default::default()
        };
        let store = TaskStore::in_memory(config, WorkRegistry::new()).unwrap();
        store.registry().register("wait", |ctx: &TaskContext, _: &Kwargs| {
            while !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(Value::Null)
        });

        let first = store.create("first", "", Map::new());
        let second = store.create("second", "", Map::new());
        store.start(&first.id, "wait", Kwargs::new()).unwrap();
        let err = store.start(&second.id, "wait", Kwargs::new()).unwrap_err();
        assert!(matches!(err, ForgeError::ResourceExhausted { .. }));
        assert_eq!(store.get(&second.id).unwrap().state, TaskState::Pending);

        store.stop(&first.id).unwrap();
        let report = store.shutdown(Duration::from_secs(5));
        assert!(report.is_clean());
    }

    #[test]
    fn test_timeout_description() {
        assert_eq!(describe_timeout(Duration::from_secs(300)), "5 minutes");
        assert_eq!(describe_timeout(Duration::from_secs(45)), "45 seconds");
    }
}
