//! One explicitly constructed task store plus job queue.

use crate::config::TaskSystemConfig;
use crate::core::errors::Result;
use crate::jobs::{DistributedBackend, JobQueue};
use crate::tasks::{ShutdownReport, StatePersistence, TaskStore, WorkRegistry};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Outcome of [`TaskSystem::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SystemShutdownReport {
    pub tasks: ShutdownReport,
    pub jobs: ShutdownReport,
}

impl SystemShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.tasks.is_clean() && self.jobs.is_clean()
    }
}

/// Task store and job queue sharing one configuration
#[derive(Clone)]
pub struct TaskSystem {
    store: TaskStore,
    queue: JobQueue,
}

impl TaskSystem {
    pub fn builder() -> TaskSystemBuilder {
        TaskSystemBuilder::new()
    }

    /// File-backed store, local-only queue, link-time work functions
    pub fn from_config(config: TaskSystemConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Shut down both halves within a shared `timeout`
    pub fn shutdown(&self, timeout: Duration) -> SystemShutdownReport {
        let deadline = Instant::now() + timeout;
        let tasks = self.store.shutdown(timeout);
        let jobs = self
            .queue
            .shutdown(deadline.saturating_duration_since(Instant::now()));
        let report = SystemShutdownReport { tasks, jobs };
        info!(clean = report.is_clean(), "Task system shut down");
        report
    }
}

/// Builder for [`TaskSystem`]
#[derive(Default)]
pub struct TaskSystemBuilder {
    config: TaskSystemConfig,
    registry: Option<WorkRegistry>,
    persistence: Option<Box<dyn StatePersistence>>,
    backend: Option<Arc<dyn DistributedBackend>>,
}

impl TaskSystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: TaskSystemConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to [`WorkRegistry::with_registered`]
    pub fn registry(mut self, registry: WorkRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the JSON state file named in the config
    pub fn persistence(mut self, persistence: Box<dyn StatePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn DistributedBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<TaskSystem> {
        self.config.validate()?;
        let registry = self.registry.unwrap_or_else(WorkRegistry::with_registered);

        let store = match self.persistence {
            Some(persistence) => TaskStore::open_with(self.config.tasks, registry, persistence)?,
            None => TaskStore::open(self.config.tasks, registry)?,
        };
        let queue = match self.backend {
            Some(backend) => JobQueue::with_backend(self.config.jobs, backend)?,
            None => JobQueue::new(self.config.jobs)?,
        };

        Ok(TaskSystem { store, queue })
    }
}
