//! Whole-file snapshots of the task map.
//!
//! Every mutating store operation rewrites the complete document
//! `{"tasks": [...], "updated_at": ...}`; there are no partial updates.

use crate::core::errors::{ForgeError, Result};
use crate::tasks::model::{iso_timestamp, Task};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// On-disk document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default, with = "iso_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StateSnapshot {
    /// Build the persisted form: each task keeps only its newest `persisted_logs` lines
    pub fn capture<'a>(tasks: impl IntoIterator<Item = &'a Task>, persisted_logs: usize) -> Self {
        Self {
            tasks: tasks
                .into_iter()
                .map(|task| task.persisted_form(persisted_logs))
                .collect(),
            updated_at: Some(Utc::now()),
        }
    }
}

/// Where snapshots go
pub trait StatePersistence: Send + Sync {
    /// `Ok(None)` when nothing was ever saved
    fn load(&self) -> Result<Option<StateSnapshot>>;

    fn save(&self, snapshot: &StateSnapshot) -> Result<()>;

    fn describe(&self) -> String;

    /// Move unreadable state out of the way so the next save cannot replace it.
    /// Returns where it went, if anywhere.
    fn set_aside(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// JSON file on local disk, replaced through a sibling temp file
#[derive(Debug, Clone)]
pub struct JsonStateFile {
    path: PathBuf,
}

impl JsonStateFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    /// Where an unparseable state file is moved on load
    pub fn corrupt_path(&self) -> PathBuf {
        self.sibling(".corrupt")
    }
}

impl StatePersistence for JsonStateFile {
    fn load(&self) -> Result<Option<StateSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| ForgeError::io(format!("read {}", self.path.display()), e))?;
        let snapshot: StateSnapshot = serde_json::from_str(&raw)?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| ForgeError::io(format!("create {}", parent.display()), e))?;
        }
        let body = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)
                .map_err(|e| ForgeError::io(format!("create {}", temp.display()), e))?;
            file.write_all(&body)
                .map_err(|e| ForgeError::io(format!("write {}", temp.display()), e))?;
            file.sync_all()
                .map_err(|e| ForgeError::io(format!("sync {}", temp.display()), e))?;
        }
        fs::rename(&temp, &self.path)
            .map_err(|e| ForgeError::io(format!("rename to {}", self.path.display()), e))?;
        debug!(path = %self.path.display(), tasks = snapshot.tasks.len(), "Persisted task state");
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn set_aside(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let target = self.corrupt_path();
        fs::rename(&self.path, &target)
            .map_err(|e| ForgeError::io(format!("rename to {}", target.display()), e))?;
        Ok(Some(target.display().to_string()))
    }
}

/// Keeps the latest snapshot in memory; for ephemeral stores and tests
#[derive(Debug, Default)]
pub struct MemoryState {
    snapshot: Mutex<Option<StateSnapshot>>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
        }
    }

    pub fn latest(&self) -> Option<StateSnapshot> {
        self.snapshot.lock().clone()
    }
}

impl StatePersistence for MemoryState {
    fn load(&self) -> Result<Option<StateSnapshot>> {
        Ok(self.snapshot.lock().clone())
    }

    fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let file = JsonStateFile::new(dir.path().join("absent.json"));
        assert!(file.load().unwrap().is_none());
    }

    #[test]
    fn test_save_truncates_logs_and_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let file = JsonStateFile::new(&path);

        let mut task = Task::new("t1", "demo", "", Map::new());
        for i in 0..80 {
            task.push_log(format!("line {}", i), 100);
        }
        file.save(&StateSnapshot::capture([&task], 50)).unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());

        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks[0].logs.len(), 50);
        assert_eq!(loaded.tasks[0].logs[0], "line 30");
        assert!(loaded.updated_at.is_some());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        let err = JsonStateFile::new(&path).load().unwrap_err();
        assert_eq!(err.category(), "serialization");
    }

    #[test]
    fn test_set_aside_moves_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        let file = JsonStateFile::new(&path);

        let moved = file.set_aside().unwrap().unwrap();
        assert!(!path.exists());
        assert_eq!(fs::read_to_string(&moved).unwrap(), "{not json");
        assert_eq!(file.set_aside().unwrap(), None);
    }
}
