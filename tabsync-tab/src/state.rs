use std::sync::{Arc, Mutex};

use serde_json::Value;
use tabsync_core::{StateSnapshot, Version};

pub trait StateStore: Send {
    fn get_snapshot(&self) -> StateSnapshot;
    fn apply_snapshot(&mut self, snapshot: StateSnapshot);
    fn apply_delta(&mut self, version: Version, patch: &Value);
}

#[derive(Debug, Clone)]
pub struct JsonStateStore {
    inner: Arc<Mutex<StateSnapshot>>,
}

impl JsonStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StateSnapshot::empty())),
        }
    }

    pub fn current(&self) -> StateSnapshot {
        match self.inner.lock() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn version(&self) -> Version {
        self.current().version
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.current().state.get(key).cloned()
    }
}

impl Default for JsonStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for JsonStateStore {
    fn get_snapshot(&self) -> StateSnapshot {
        self.current()
    }

    fn apply_snapshot(&mut self, snapshot: StateSnapshot) {
        if let Ok(mut current) = self.inner.lock() {
            *current = snapshot;
        }
    }

    fn apply_delta(&mut self, version: Version, patch: &Value) {
        if let Ok(mut current) = self.inner.lock() {
            let mut state = std::mem::take(&mut current.state);
            merge_patch(&mut state, patch);
            *current = StateSnapshot::new(version, state);
        }
    }
}

pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
