use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub type TaskId = String;

/// Error text written on load for tasks that were `Running` when the process died
pub const INTERRUPTED_ERROR: &str = "Task was interrupted (app restart)";
/// Error text for a `Running` task whose thread is gone
pub const DEAD_THREAD_ERROR: &str = "Thread died unexpectedly";
/// Log line appended by `stop`
pub const CANCELLED_LOG: &str = "Task cancelled by user";

/// Optional timestamps, written as RFC 3339.
///
/// Reading also accepts naive ISO-8601 values, taken as local time. A value
/// that parses as neither reads as unset.
pub mod iso_timestamp {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(parse))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        let naive = NAIVE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())?;
        Some(match Local.from_local_datetime(&naive).earliest() {
            Some(local) => local.with_timezone(&Utc),
            None => naive.and_utc(),
        })
    }
}

/// Well-known keys inside [`Task::metadata`]
pub mod meta {
    /// Registry key of the work function
    pub const BACKGROUND_TARGET: &str = "background_target";
    /// Keyword arguments the work function was started with
    pub const BACKGROUND_KWARGS: &str = "background_kwargs";
    pub const RECOVERY_ATTEMPTS: &str = "recovery_attempts";
    pub const MAX_RECOVERY_ATTEMPTS: &str = "max_recovery_attempts";
    pub const MANUAL_RETRIES: &str = "manual_retries";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Reserved; nothing transitions into or out of it
    Paused,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// States a retry may start from
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_artifact_kind() -> String {
    "file".to_string()
}

fn default_artifact_name() -> String {
    "Unknown".to_string()
}

/// Named output produced by a task, e.g. a generated file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(default = "default_artifact_name")]
    pub name: String,
    #[serde(rename = "type", default = "default_artifact_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            path: None,
            extra: Map::new(),
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new(name, default_artifact_kind())
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A durable, individually tracked long-running operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub state: TaskState,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub current_step: String,
    #[serde(default)]
    pub total_steps: u32,
    #[serde(default)]
    pub completed_steps: u32,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, with = "iso_timestamp")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "iso_timestamp")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        name: impl Into<String>,
        description: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            state: TaskState::Pending,
            progress: 0.0,
            current_step: String::new(),
            total_steps: 0,
            completed_steps: 0,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            logs: Vec::new(),
            artifacts: Vec::new(),
            metadata,
        }
    }

    /// Clamp into [0, 1]; NaN counts as no progress
    pub fn set_progress(&mut self, progress: f64) {
        self.progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
    }

    /// Append a raw log line, keeping only the newest `cap` lines
    pub fn push_log(&mut self, line: impl Into<String>, cap: usize) {
        self.logs.push(line.into());
        truncate_front(&mut self.logs, cap);
    }

    /// Append `[HH:MM:SS] message`, keeping only the newest `cap` lines
    pub fn push_timestamped_log(&mut self, message: &str, cap: usize) {
        let stamp = Utc::now().format("%H:%M:%S");
        self.push_log(format!("[{}] {}", stamp, message), cap);
    }

    /// Re-apply the in-memory bounds after a work function edited the task directly
    pub(crate) fn enforce_bounds(&mut self, max_logs: usize) {
        self.set_progress(self.progress);
        truncate_front(&mut self.logs, max_logs);
    }

    /// Copy written to the state file: only the newest `persisted_logs` lines
    pub fn persisted_form(&self, persisted_logs: usize) -> Task {
        let mut copy = self.clone();
        truncate_front(&mut copy.logs, persisted_logs);
        copy
    }

    /// Failed by the crash-detection pass on load
    pub fn is_interrupted(&self) -> bool {
        self.state == TaskState::Failed
            && self
                .error
                .as_deref()
                .map(|e| e.to_lowercase().contains("interrupted"))
                .unwrap_or(false)
    }

    pub fn background_target(&self) -> Option<&str> {
        self.metadata
            .get(meta::BACKGROUND_TARGET)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn background_kwargs(&self) -> Map<String, Value> {
        match self.metadata.get(meta::BACKGROUND_KWARGS) {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.meta_u32(meta::RECOVERY_ATTEMPTS).unwrap_or(0)
    }

    pub fn max_recovery_attempts(&self) -> u32 {
        self.meta_u32(meta::MAX_RECOVERY_ATTEMPTS).unwrap_or(1)
    }

    pub fn meta_u32(&self, key: &str) -> Option<u32> {
        self.metadata
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| v.min(u32::MAX as u64) as u32)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Wall time of the last run, once it finished
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

fn truncate_front(lines: &mut Vec<String>, cap: usize) {
    if lines.len() > cap {
        let excess = lines.len() - cap;
        lines.drain(..excess);
    }
}
