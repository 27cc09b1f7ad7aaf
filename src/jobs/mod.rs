//! Coarse-grained jobs submitted by many callers, executed on a distributed
//! backend when one is available and on local threads otherwise.

pub mod backend;
pub mod batch;
pub mod model;
pub mod profiles;
pub mod queue;

pub use backend::{DispatchRequest, DistributedBackend, JobOutcome, PendingResult, TokioBackend};
pub use batch::{all_done, collect_results, status_counts, submit_batch, wait_for_all, BatchOutcome, StatusCounts};
pub use model::{Job, JobFn, JobId, JobKwargs, JobSnapshot, JobSpec, JobStatus, JobType};
pub use profiles::{profile_for, ResourceProfile, DEFAULT_PROFILE};
pub use queue::{JobQueue, QueueStats};
