use crate::core::errors::{ForgeError, Result};
use crate::tasks::model::{meta, Task};
use crate::tasks::registry::Kwargs;
use crate::tasks::store::TaskStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

/// Tally of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    /// Interrupted tasks examined
    pub interrupted: usize,
    pub resumed: usize,
    /// No work-function key recorded
    pub skipped_no_target: usize,
    /// `recovery_attempts` already at the ceiling
    pub skipped_exhausted: usize,
    /// Key not present in the registry
    pub skipped_unresolved: usize,
    /// Restart attempted but refused (limits, shutdown)
    pub failed: usize,
}

/// Adjustments applied by a manual retry before the task restarts
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    /// Replace the saved kwargs
    pub override_kwargs: Option<Kwargs>,
    /// Set `recovery_attempts` back to 0
    pub reset_attempts: bool,
    /// New `max_recovery_attempts`
    pub max_attempts: Option<u32>,
}

impl RetryOptions {
    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.override_kwargs = Some(kwargs);
        self
    }

    pub fn reset_attempts(mut self) -> Self {
        self.reset_attempts = true;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

enum Outcome {
    Resumed,
    NoTarget,
    Exhausted,
    Unresolved,
}

/// Resumes interrupted tasks through the normal start path
pub struct CrashRecovery<'a> {
    store: &'a TaskStore,
}

impl<'a> CrashRecovery<'a> {
    pub fn new(store: &'a TaskStore) -> Self {
        Self { store }
    }

    /// One pass over every interrupted task. Never fails; problems are counted and logged.
    pub fn recover(&self) -> RecoveryStats {
        let mut stats = RecoveryStats::default();
        for task in self.store.list_all() {
            if !task.is_interrupted() {
                continue;
            }
            stats.interrupted += 1;
            match self.recover_task(&task) {
                Ok(Outcome::Resumed) => stats.resumed += 1,
                Ok(Outcome::NoTarget) => stats.skipped_no_target += 1,
                Ok(Outcome::Exhausted) => stats.skipped_exhausted += 1,
                Ok(Outcome::Unresolved) => stats.skipped_unresolved += 1,
                Err(e) => {
                    error!(task_id = %task.id, "Failed to restart interrupted task: {}", e);
                    stats.failed += 1;
                }
            }
        }
        if stats.interrupted > 0 {
            info!(
                interrupted = stats.interrupted,
                resumed = stats.resumed,
                "Recovery pass finished"
            );
        }
        stats
    }

    fn recover_task(&self, task: &Task) -> Result<Outcome> {
        let Some(target) = task.background_target() else {
            info!(task_id = %task.id, "Skipping recovery: no background_target metadata");
            return Ok(Outcome::NoTarget);
        };

        let attempts = task.recovery_attempts();
        let max_attempts = self.max_attempts_of(task);
        if attempts >= max_attempts {
            info!(
                task_id = %task.id,
                attempts, max_attempts, "Max recovery attempts reached"
            );
            return Ok(Outcome::Exhausted);
        }

        let Some(work) = self.store.registry().get(target) else {
            warn!(task_id = %task.id, target = %target, "Skipping recovery: work function not registered");
            return Ok(Outcome::Unresolved);
        };

        info!(
            task_id = %task.id,
            attempt = attempts + 1,
            max_attempts,
            "Attempting to recover interrupted task"
        );
        self.store.rerun(&task.id, target, work, |t| {
            t.set_meta(meta::RECOVERY_ATTEMPTS, attempts + 1);
        })?;
        Ok(Outcome::Resumed)
    }

    /// Manually re-run a `Failed` or `Cancelled` task from its saved metadata.
    ///
    /// Metadata edits from `options` are persisted before the work function
    /// is resolved, so they stick even when resolution fails.
    pub fn retry(&self, task_id: &str, options: RetryOptions) -> Result<()> {
        let target = self.store.edit_task(task_id, |task| {
            if !task.state.is_retryable() {
                return Err(ForgeError::invalid_transition(
                    task_id,
                    task.state,
                    "retry",
                ));
            }
            let target = task
                .background_target()
                .map(str::to_string)
                .ok_or_else(|| ForgeError::NotResumable(task_id.to_string()))?;

            if options.reset_attempts {
                task.set_meta(meta::RECOVERY_ATTEMPTS, 0);
            }
            if let Some(max) = options.max_attempts {
                task.set_meta(meta::MAX_RECOVERY_ATTEMPTS, max);
            }
            if let Some(kwargs) = options.override_kwargs {
                task.set_meta(meta::BACKGROUND_KWARGS, Value::Object(kwargs));
            }
            Ok(target)
        })?;

        let work = self
            .store
            .registry()
            .get(&target)
            .ok_or_else(|| ForgeError::UnknownWorkFunction(target.clone()))?;

        info!(task_id = %task_id, target = %target, "Manually retrying task");
        self.store.rerun(task_id, &target, work, |task| {
            let retries = task.meta_u32(meta::MANUAL_RETRIES).unwrap_or(0);
            task.set_meta(meta::MANUAL_RETRIES, retries + 1);
        })
    }

    fn max_attempts_of(&self, task: &Task) -> u32 {
        task.meta_u32(meta::MAX_RECOVERY_ATTEMPTS)
            .unwrap_or(self.store.config().default_max_recovery_attempts)
    }
}
