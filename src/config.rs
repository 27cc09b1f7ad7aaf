use crate::core::errors::{ForgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the task state document
pub const DEFAULT_STATE_FILE: &str = ".background_tasks_state.json";

/// Task store tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskStoreConfig {
    /// JSON document mirroring every task
    pub state_file: PathBuf,
    /// Log lines kept per task in memory
    pub max_log_entries: usize,
    /// Log lines kept per task in the state file
    pub persisted_log_entries: usize,
    /// Startup sweep: tasks still at zero progress this long after starting are failed
    pub stuck_task_timeout: Duration,
    /// Automatic resumptions allowed per interrupted task unless its metadata says otherwise
    pub default_max_recovery_attempts: u32,
    /// Resume interrupted tasks while opening the store
    pub auto_recover: bool,
    /// Ceiling on concurrently running tasks (`None` = unbounded)
    pub max_running_tasks: Option<usize>,
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            max_log_entries: 100,
            persisted_log_entries: 50,
            stuck_task_timeout: Duration::from_secs(5 * 60),
            default_max_recovery_attempts: 1,
            auto_recover: true,
            max_running_tasks: None,
        }
    }
}

impl TaskStoreConfig {
    pub fn with_state_file(path: impl AsRef<Path>) -> Self {
        Self {
            state_file: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_log_entries == 0 {
            return Err(ForgeError::configuration(
                "max_log_entries must be greater than 0",
            ));
        }
        if self.persisted_log_entries > self.max_log_entries {
            return Err(ForgeError::configuration(
                "persisted_log_entries cannot exceed max_log_entries",
            ));
        }
        if self.max_running_tasks == Some(0) {
            return Err(ForgeError::configuration(
                "max_running_tasks must be greater than 0",
            ));
        }
        if self.state_file.as_os_str().is_empty() {
            return Err(ForgeError::configuration("state_file must not be empty"));
        }
        Ok(())
    }
}

/// What local execution does with a job once every slot is busy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Keep the job `Queued` and dispatch it, in submit order, when a slot frees
    #[default]
    Queue,
    /// Fail the submit with `ResourceExhausted`
    Reject,
}

/// Job queue tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQueueConfig {
    /// Ceiling on locally executing jobs
    pub max_concurrent_jobs: usize,
    pub admission: AdmissionPolicy,
    /// Poll period while a caller waits on a local job
    pub result_poll_interval: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            admission: AdmissionPolicy::Queue,
            result_poll_interval: Duration::from_millis(10),
        }
    }
}

impl JobQueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(ForgeError::configuration(
                "max_concurrent_jobs must be greater than 0",
            ));
        }
        if self.result_poll_interval.is_zero() {
            return Err(ForgeError::configuration(
                "result_poll_interval must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Configuration for a whole [`crate::TaskSystem`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TaskSystemConfig {
    pub tasks: TaskStoreConfig,
    pub jobs: JobQueueConfig,
}

impl TaskSystemConfig {
    pub fn builder() -> TaskSystemConfigBuilder {
        TaskSystemConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        self.tasks.validate()?;
        self.jobs.validate()
    }

    /// Read a JSON config file; absent fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ForgeError::io(format!("read {}", path.display()), e))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }
}

/// Builder for TaskSystemConfig
pub struct TaskSystemConfigBuilder {
    config: TaskSystemConfig,
}

impl TaskSystemConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TaskSystemConfig::default(),
        }
    }

    pub fn state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tasks.state_file = path.into();
        self
    }

    pub fn log_limits(mut self, in_memory: usize, persisted: usize) -> Self {
        self.config.tasks.max_log_entries = in_memory;
        self.config.tasks.persisted_log_entries = persisted;
        self
    }

    pub fn stuck_task_timeout(mut self, timeout: Duration) -> Self {
        self.config.tasks.stuck_task_timeout = timeout;
        self
    }

    pub fn max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.config.tasks.default_max_recovery_attempts = attempts;
        self
    }

    pub fn auto_recover(mut self, enabled: bool) -> Self {
        self.config.tasks.auto_recover = enabled;
        self
    }

    pub fn max_running_tasks(mut self, limit: Option<usize>) -> Self {
        self.config.tasks.max_running_tasks = limit;
        self
    }

    pub fn max_concurrent_jobs(mut self, limit: usize) -> Self {
        self.config.jobs.max_concurrent_jobs = limit;
        self
    }

    pub fn admission(mut self, policy: AdmissionPolicy) -> Self {
        self.config.jobs.admission = policy;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<TaskSystemConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for TaskSystemConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = TaskSystemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tasks.max_log_entries, 100);
        assert_eq!(config.tasks.persisted_log_entries, 50);
        assert_eq!(config.jobs.max_concurrent_jobs, 10);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = TaskSystemConfig::default();
        config.tasks.persisted_log_entries = 200;
        assert!(config.validate().is_err());
        config.tasks.persisted_log_entries = 50;

        config.jobs.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());
        config.jobs.max_concurrent_jobs = 4;

        config.tasks.max_running_tasks = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = TaskSystemConfig::builder()
            .state_file("/tmp/forge/state.json")
            .log_limits(20, 10)
            .max_recovery_attempts(3)
            .max_concurrent_jobs(2)
            .admission(AdmissionPolicy::Reject)
            .build()
            .unwrap();

        assert_eq!(config.tasks.state_file, PathBuf::from("/tmp/forge/state.json"));
        assert_eq!(config.tasks.max_log_entries, 20);
        assert_eq!(config.tasks.default_max_recovery_attempts, 3);
        assert_eq!(config.jobs.admission, AdmissionPolicy::Reject);
    }

    #[test]
    fn test_partial_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("forge.json");
        std::fs::write(
            &path,
            r#"{"tasks": {"auto_recover": false}, "jobs": {"admission": "reject"}}"#,
        )
        .unwrap();

        let config = TaskSystemConfig::from_json_file(&path).unwrap();
        assert!(!config.tasks.auto_recover);
        assert_eq!(config.tasks.max_log_entries, 100);
        assert_eq!(config.jobs.admission, AdmissionPolicy::Reject);
    }
}
