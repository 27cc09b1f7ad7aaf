use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

pub type JobId = String;

/// Keyword arguments handed to a job function
pub type JobKwargs = Map<String, Value>;

pub const DEFAULT_PRIORITY: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain category of a job; selects its resource profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ImageGeneration,
    VideoGeneration,
    TextGeneration,
    ProductCreation,
    CampaignGeneration,
    BlogGeneration,
    WorkflowExecution,
    BatchOperation,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ImageGeneration => "image_generation",
            JobType::VideoGeneration => "video_generation",
            JobType::TextGeneration => "text_generation",
            JobType::ProductCreation => "product_creation",
            JobType::CampaignGeneration => "campaign_generation",
            JobType::BlogGeneration => "blog_generation",
            JobType::WorkflowExecution => "workflow_execution",
            JobType::BatchOperation => "batch_operation",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of work behind a job. The queue never interprets the arguments.
pub trait JobFn: Send + Sync + 'static {
    fn call(&self, args: &[Value], kwargs: &JobKwargs) -> anyhow::Result<Value>;
}

impl<F> JobFn for F
where
    F: Fn(&[Value], &JobKwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    fn call(&self, args: &[Value], kwargs: &JobKwargs) -> anyhow::Result<Value> {
        self(args, kwargs)
    }
}

/// Everything `submit` needs
#[derive(Clone)]
pub struct JobSpec {
    pub job_type: JobType,
    pub tab_name: String,
    pub description: String,
    pub function: Arc<dyn JobFn>,
    pub args: Vec<Value>,
    pub kwargs: JobKwargs,
    pub priority: u8,
    pub metadata: Map<String, Value>,
}

impl JobSpec {
    pub fn new<F>(
        job_type: JobType,
        tab_name: impl Into<String>,
        description: impl Into<String>,
        function: F,
    ) -> Self
    where
        F: Fn(&[Value], &JobKwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::with_function(job_type, tab_name, description, Arc::new(function))
    }

    /// Same as [`new`](Self::new) for a function shared between jobs
    pub fn with_function(
        job_type: JobType,
        tab_name: impl Into<String>,
        description: impl Into<String>,
        function: Arc<dyn JobFn>,
    ) -> Self {
        Self {
            job_type,
            tab_name: tab_name.into(),
            description: description.into(),
            function,
            args: Vec::new(),
            kwargs: JobKwargs::new(),
            priority: DEFAULT_PRIORITY,
            metadata: Map::new(),
        }
    }

    pub fn arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Clamped to 1..=10
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A submitted unit of work and its outcome
#[derive(Clone)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub tab_name: String,
    pub description: String,
    pub function: Arc<dyn JobFn>,
    pub args: Vec<Value>,
    pub kwargs: JobKwargs,
    pub status: JobStatus,
    pub priority: u8,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: f64,
    pub metadata: Map<String, Value>,
}

impl Job {
    pub fn from_spec(id: impl Into<JobId>, spec: JobSpec) -> Self {
        Self {
            id: id.into(),
            job_type: spec.job_type,
            tab_name: spec.tab_name,
            description: spec.description,
            function: spec.function,
            args: spec.args,
            kwargs: spec.kwargs,
            status: JobStatus::Queued,
            priority: spec.priority,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            metadata: spec.metadata,
        }
    }

    /// Seconds between start and completion
    pub fn duration(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_completed(&mut self, value: Value) {
        self.result = Some(value);
        self.error = None;
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.progress = 1.0;
    }

    pub(crate) fn mark_failed(&mut self, message: String) {
        self.status = JobStatus::Failed;
        self.error = Some(message);
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            job_type: self.job_type,
            tab_name: self.tab_name.clone(),
            description: self.description.clone(),
            status: self.status,
            priority: self.priority,
            result: self.result.as_ref().and_then(stringify_result),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            progress: self.progress,
            duration: self.duration(),
            metadata: self.metadata.clone(),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("job_type", &self.job_type)
            .field("tab_name", &self.tab_name)
            .field("status", &self.status)
            .field("priority", &self.priority)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

fn stringify_result(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Serializable view of a [`Job`] without its function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub job_type: JobType,
    pub tab_name: String,
    pub description: String,
    pub status: JobStatus,
    pub priority: u8,
    /// Result rendered as text
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: f64,
    /// Seconds
    pub duration: Option<f64>,
    pub metadata: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(_args: &[Value], _kwargs: &JobKwargs) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    #[test]
    fn test_spec_builder_clamps_priority() {
        let spec = JobSpec::new(JobType::TextGeneration, "blog", "draft", noop)
            .arg(json!("topic"))
            .kwarg("words", json!(800))
            .priority(42);
        assert_eq!(spec.priority, 10);
        assert_eq!(spec.args, vec![json!("topic")]);

        let low = JobSpec::new(JobType::TextGeneration, "blog", "draft", noop).priority(0);
        assert_eq!(low.priority, 1);
    }

    #[test]
    fn test_snapshot_stringifies_result() {
        let mut job = Job::from_spec(
            "j1",
            JobSpec::new(JobType::ImageGeneration, "studio", "mockup", noop),
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.duration().is_none());

        job.mark_running();
        job.mark_completed(json!({"url": "https://cdn/x.png"}));
        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.result.as_deref(), Some(r#"{"url":"https://cdn/x.png"}"#));
        assert!(snapshot.duration.unwrap() >= 0.0);

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["job_type"], json!("image_generation"));
        assert_eq!(value["status"], json!("completed"));
    }
}
