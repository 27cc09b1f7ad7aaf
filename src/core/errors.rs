use thiserror::Error;

/// Unified error type for the task store, the job queue and their helpers
#[derive(Debug, Error)]
pub enum ForgeError {
    /// No task with this id is known to the store
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// No job with this id is known to the queue
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The requested operation is not valid from the task's current state
    #[error("Task {task_id} cannot {operation} from state {state}")]
    InvalidTransition {
        task_id: String,
        state: String,
        operation: String,
    },

    /// The task carries no work-function key, so it cannot be restarted
    #[error("Task {0} has no background_target metadata to retry")]
    NotResumable(String),

    /// A work-function key that nothing registered
    #[error("Work function not registered: {0}")]
    UnknownWorkFunction(String),

    /// Admission control refused new work
    #[error("Resource exhausted: {resource} (current: {current}, limit: {limit})")]
    ResourceExhausted {
        resource: String,
        current: u64,
        limit: u64,
    },

    /// The owning system is shutting down and accepts no new work
    #[error("System shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A job finished with an error reported by its execution backend
    #[error("Job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    /// The distributed backend refused or lost a dispatch
    #[error("Backend {backend} error: {message}")]
    Backend { backend: String, message: String },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForgeError {
    /// Create an invalid-transition error
    pub fn invalid_transition<I, S, O>(task_id: I, state: S, operation: O) -> Self
    where
        I: Into<String>,
        S: std::fmt::Display,
        O: Into<String>,
    {
        Self::InvalidTransition {
            task_id: task_id.into(),
            state: state.to_string(),
            operation: operation.into(),
        }
    }

    /// Create a resource exhaustion error
    pub fn resource_exhausted<S: Into<String>>(resource: S, current: u64, limit: u64) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            current,
            limit,
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a backend error
    pub fn backend<B: Into<String>, M: Into<String>>(backend: B, message: M) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Check if retrying the same call later could succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ResourceExhausted { .. } | Self::Io { .. } | Self::Backend { .. } => true,
            Self::JobFailed { .. } => true,
            Self::Configuration(_) | Self::ShuttingDown => false,
            Self::InvalidTransition { .. } | Self::NotResumable(_) => false,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::TaskNotFound(_) | Self::InvalidTransition { .. } | Self::NotResumable(_) => {
                "task"
            }
            Self::JobNotFound(_) | Self::JobFailed { .. } => "job",
            Self::UnknownWorkFunction(_) => "registry",
            Self::ResourceExhausted { .. } => "resource",
            Self::ShuttingDown => "lifecycle",
            Self::Configuration(_) => "configuration",
            Self::Backend { .. } => "backend",
            Self::Io { .. } => "io",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ForgeError>;

impl From<std::io::Error> for ForgeError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}
