//! Registry of resumable work functions
//!
//! A task records the key of its work function in its metadata; crash
//! recovery and manual retry look that key up here.

use crate::tasks::runner::TaskContext;
use linkme::distributed_slice;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, warn};

/// Keyword arguments handed to a work function
pub type Kwargs = Map<String, Value>;

/// Body of a background task
pub trait WorkFn: Send + Sync + 'static {
    /// Run to completion. Returning `Err` fails the task.
    fn run(&self, ctx: &TaskContext, kwargs: &Kwargs) -> anyhow::Result<Value>;
}

impl<F> WorkFn for F
where
    F: Fn(&TaskContext, &Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    fn run(&self, ctx: &TaskContext, kwargs: &Kwargs) -> anyhow::Result<Value> {
        self(ctx, kwargs)
    }
}

/// Link-time registration emitted by `#[work_function]`
pub struct WorkRegistration {
    pub name: &'static str,
    pub function: fn(&TaskContext, &Kwargs) -> anyhow::Result<Value>,
}

#[distributed_slice]
pub static WORK_FUNCTIONS: [WorkRegistration] = [..];

/// Name-keyed work functions
#[derive(Clone)]
pub struct WorkRegistry {
    functions: Arc<RwLock<HashMap<String, Arc<dyn WorkFn>>>>,
}

impl WorkRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            functions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registry pre-filled with every `#[work_function]` linked into the binary
    pub fn with_registered() -> Self {
        let registry = Self::new();
        for entry in WORK_FUNCTIONS {
            registry.register(entry.name, entry.function);
        }
        debug!(count = WORK_FUNCTIONS.len(), "Loaded link-time work functions");
        registry
    }

    /// Register `work` under `name`, replacing any earlier entry
    pub fn register<F>(&self, name: impl Into<String>, work: F)
    where
        F: Fn(&TaskContext, &Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register_arc(name, Arc::new(work));
    }

    pub fn register_arc(&self, name: impl Into<String>, work: Arc<dyn WorkFn>) {
        let name = name.into();
        if self.functions.write().insert(name.clone(), work).is_some() {
            warn!(work_function = %name, "Replaced previously registered work function");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkFn>> {
        self.functions.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    /// Registered keys, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for WorkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn typed arguments into [`Kwargs`] for the task metadata.
///
/// An object serializes field by field; any other JSON value lands under
/// `"value"`. If serialization fails the `Debug` rendering is kept under
/// `"repr"`, which will not round-trip on recovery.
pub fn kwargs_from<T: Serialize + Debug>(args: &T) -> Kwargs {
    match serde_json::to_value(args) {
        Ok(Value::Object(map)) => map,
        Ok(Value::Null) => Kwargs::new(),
        Ok(other) => {
            let mut map = Kwargs::new();
            map.insert("value".to_string(), other);
            map
        }
        Err(e) => {
            warn!("Kwargs are not JSON-serializable, storing debug form: {}", e);
            let mut map = Kwargs::new();
            map.insert("repr".to_string(), Value::String(format!("{:?}", args)));
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn noop(_ctx: &TaskContext, _kwargs: &Kwargs) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = WorkRegistry::new();
        registry.register("noop", noop);
        registry.register("echo", |_ctx: &TaskContext, kwargs: &Kwargs| {
            Ok(Value::Object(kwargs.clone()))
        });

        assert!(registry.contains("noop"));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.list(), vec!["echo".to_string(), "noop".to_string()]);
    }

    #[test]
    fn test_clones_share_entries() {
        let registry = WorkRegistry::new();
        let clone = registry.clone();
        clone.register("noop", noop);
        assert!(registry.contains("noop"));
    }

    #[test]
    fn test_kwargs_from_struct_and_scalar() {
        #[derive(Serialize, Debug)]
        struct Render {
            prompt: String,
            frames: u32,
        }

        let kwargs = kwargs_from(&Render {
            prompt: "sunset".into(),
            frames: 24,
        });
        assert_eq!(kwargs.get("frames"), Some(&json!(24)));

        let scalar = kwargs_from(&7);
        assert_eq!(scalar.get("value"), Some(&json!(7)));

        assert!(kwargs_from(&()).is_empty());
    }

    #[test]
    fn test_kwargs_from_falls_back_to_debug() {
        // Non-string map keys cannot become JSON object keys
        let mut odd = BTreeMap::new();
        odd.insert((1, 2), "pair");
        let kwargs = kwargs_from(&odd);
        assert!(kwargs.get("repr").and_then(Value::as_str).unwrap().contains("pair"));
    }
}
