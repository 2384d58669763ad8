//! Hierarchical key-value store holding module config and orchestrator state
//! between reconciles.
//!
//! Paths are dot separated (`systemRegistry.internal.orchestrator`). A path
//! that is absent is reported as [`Error::InputValueNotExist`], which callers
//! keep distinct from a value that is present but fails to decode.

use std::sync::{Arc, RwLock};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub const CONFIG_PATH: &str = "systemRegistry.config";
pub const STATE_PATH: &str = "systemRegistry.internal.orchestrator.state";
pub const READY_PATH: &str = "systemRegistry.internal.ready";
pub const GLOBAL_REGISTRY_PATH: &str = "global.modulesImages.registry";

pub trait ValuesStore: Send + Sync {
    fn get(&self, path: &str) -> Option<Value>;
    fn set(&self, path: &str, value: Value);
    fn remove(&self, path: &str);
}

/// Decode the value at `path`
pub fn get_typed<T: DeserializeOwned>(store: &dyn ValuesStore, path: &str) -> Result<T> {
    match store.get(path) {
        None | Some(Value::Null) => Err(Error::InputValueNotExist(path.to_string())),
        Some(value) => Ok(serde_json::from_value(value)?),
    }
}

/// Decode the value at `path`, mapping absence to `None`
pub fn get_optional<T: DeserializeOwned>(store: &dyn ValuesStore, path: &str) -> Result<Option<T>> {
    match get_typed(store, path) {
        Ok(v) => Ok(Some(v)),
        Err(Error::InputValueNotExist(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn set_typed<T: Serialize>(store: &dyn ValuesStore, path: &str, value: &T) -> Result<()> {
    store.set(path, serde_json::to_value(value)?);
    Ok(())
}

/// In-process values store
#[derive(Clone, Default)]
pub struct MemoryValues {
    root: Arc<RwLock<Value>>,
}

impl MemoryValues {
    pub fn new() -> Self {
        Self {
            root: Arc::new(RwLock::new(Value::Object(Map::new()))),
        }
    }

    /// Snapshot of the whole tree
    pub fn snapshot(&self) -> Value {
        match self.root.read() {
            Ok(root) => root.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ValuesStore for MemoryValues {
    fn get(&self, path: &str) -> Option<Value> {
        let root = match self.root.read() {
            Ok(root) => root,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut current = &*root;
        for key in path.split('.') {
            current = current.as_object()?.get(key)?;
        }
        Some(current.clone())
    }

    fn set(&self, path: &str, value: Value) {
        let mut root = match self.root.write() {
            Ok(root) => root,
            Err(poisoned) => poisoned.into_inner(),
        };
        let keys: Vec<&str> = path.split('.').collect();
        let Some((last, parents)) = keys.split_last() else {
            return;
        };

        let mut current = &mut *root;
        for key in parents {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            current = match current {
                Value::Object(map) => map
                    .entry((*key).to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                _ => return,
            };
        }
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        if let Value::Object(map) = current {
            map.insert((*last).to_string(), value);
        }
    }

    fn remove(&self, path: &str) {
        let mut root = match self.root.write() {
            Ok(root) => root,
            Err(poisoned) => poisoned.into_inner(),
        };
        let keys: Vec<&str> = path.split('.').collect();
        let Some((last, parents)) = keys.split_last() else {
            return;
        };

        let mut current = &mut *root;
        for key in parents {
            match current.as_object_mut().and_then(|m| m.get_mut(*key)) {
                Some(next) => current = next,
                None => return,
            }
        }
        if let Some(map) = current.as_object_mut() {
            map.remove(*last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_creates_intermediate_objects() {
        let values = MemoryValues::new();
        values.set("a.b.c", json!(1));
        assert_eq!(values.get("a.b.c"), Some(json!(1)));
        assert_eq!(values.get("a.b"), Some(json!({"c": 1})));
        assert_eq!(values.get("a.x"), None);
    }

    #[test]
    fn remove_leaves_siblings() {
        let values = MemoryValues::new();
        values.set("a.b", json!(1));
        values.set("a.c", json!(2));
        values.remove("a.b");
        assert_eq!(values.get("a"), Some(json!({"c": 2})));
        values.remove("missing.path");
    }

    #[test]
    fn typed_access_distinguishes_absent_from_invalid() {
        let values = MemoryValues::new();
        let err = get_typed::<u32>(&values, "x").unwrap_err();
        assert!(matches!(err, Error::InputValueNotExist(_)));

        values.set("x", json!("not a number"));
        let err = get_typed::<u32>(&values, "x").unwrap_err();
        assert!(matches!(err, Error::SerializationError(_)));

        assert_eq!(get_optional::<u32>(&values, "y").unwrap(), None);
    }
}
