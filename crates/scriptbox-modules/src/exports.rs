// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared exports containers and module records

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

/// A module's mutable exports container.
///
/// Cloning yields another handle to the same container, so a module that is
/// still executing can hand out its partially populated exports to cyclic
/// requirers.
#[derive(Clone, Debug)]
pub struct Exports(Arc<Mutex<Value>>);

impl Default for Exports {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Value> for Exports {
    fn from(value: Value) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }
}

impl Exports {
    /// An empty object
    pub fn new() -> Self {
        Value::Object(Map::new()).into()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.lock().unwrap().get(key).cloned()
    }

    /// Set a property. A non-object value is replaced by an object first.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let mut inner = self.0.lock().unwrap();
        if !inner.is_object() {
            *inner = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut *inner {
            map.insert(key.into(), value);
        }
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.lock().unwrap().as_object_mut().and_then(|map| map.remove(key))
    }

    /// Replace the whole value while keeping the container's identity
    pub fn replace(&self, value: Value) {
        *self.0.lock().unwrap() = value;
    }

    /// Snapshot of the current contents
    pub fn to_value(&self) -> Value {
        self.0.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// True when both handles refer to the same container
    pub fn ptr_eq(&self, other: &Exports) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug)]
struct RecordInner {
    id: String,
    exports: Exports,
    loaded: AtomicBool,
}

/// Per-path module record: `{ exports, id, loaded }`.
///
/// A record is a shared handle; the cache, the executing body and every
/// requirer observe the same exports and the same `loaded` flag.
#[derive(Clone, Debug)]
pub struct ModuleRecord(Arc<RecordInner>);

impl ModuleRecord {
    /// A fresh, not yet loaded record with empty exports
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_exports(id, Exports::new(), false)
    }

    pub fn with_exports(id: impl Into<String>, exports: Exports, loaded: bool) -> Self {
        Self(Arc::new(RecordInner {
            id: id.into(),
            exports,
            loaded: AtomicBool::new(loaded),
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn exports(&self) -> Exports {
        self.0.exports.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.0.loaded.load(Ordering::Acquire)
    }

    pub fn mark_loaded(&self) {
        self.0.loaded.store(true, Ordering::Release);
    }

    pub fn ptr_eq(&self, other: &ModuleRecord) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
