//! Durable background tasks: one OS thread per run, state mirrored to a JSON file.

pub mod model;
pub mod persistence;
pub mod recovery;
pub mod registry;
pub mod runner;
pub mod store;

pub use model::{Artifact, Task, TaskId, TaskState};
pub use persistence::{JsonStateFile, MemoryState, StatePersistence, StateSnapshot};
pub use recovery::{CrashRecovery, RecoveryStats, RetryOptions};
pub use registry::{kwargs_from, Kwargs, WorkFn, WorkRegistration, WorkRegistry, WORK_FUNCTIONS};
pub use runner::{CancellationToken, TaskContext};
pub use store::{ShutdownReport, TaskStore};
