//! Durable background tasks and a resource-aware job queue.
//!
//! [`TaskStore`] runs named tasks on their own threads, mirrors their state
//! to a JSON file and resumes interrupted work after a restart.
//! [`JobQueue`] runs short-lived jobs locally or on a [`DistributedBackend`].

// Lets `#[work_function]` expand to `::taskforge::...` inside this crate too
extern crate self as taskforge;

// Core infrastructure modules
pub mod core {
    pub mod errors;
    pub mod limits;
    pub mod retry;
}

pub mod config;
pub mod jobs;
pub mod logging;
pub mod system;
pub mod tasks;

pub use linkme;
pub use taskforge_macros::work_function;

// Re-exports for convenience
pub use crate::config::{AdmissionPolicy, JobQueueConfig, TaskStoreConfig, TaskSystemConfig};
pub use crate::core::errors::{ForgeError, Result};
pub use crate::core::limits::{ConcurrencyLimiter, ConcurrencyLimits, ExecutionPermit, LimiterStats};
pub use crate::core::retry::{retry_with_backoff, retry_with_backoff_async, RetryPolicy};
pub use crate::jobs::{
    DistributedBackend, Job, JobId, JobQueue, JobSpec, JobStatus, JobType, QueueStats, TokioBackend,
};
pub use crate::system::{SystemShutdownReport, TaskSystem, TaskSystemBuilder};
pub use crate::tasks::{
    Kwargs, RetryOptions, ShutdownReport, Task, TaskContext, TaskId, TaskState, TaskStore,
    WorkRegistry,
};
