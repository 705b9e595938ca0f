// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Module record cache: one record per absolute path, no eviction policy

use std::collections::HashMap;
use std::sync::Mutex;

use crate::exports::ModuleRecord;

#[derive(Debug, Default)]
pub struct ModuleCache {
    records: Mutex<HashMap<String, ModuleRecord>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<ModuleRecord> {
        self.records.lock().unwrap().get(path).cloned()
    }

    pub fn set(&self, path: impl Into<String>, record: ModuleRecord) {
        self.records.lock().unwrap().insert(path.into(), record);
    }

    pub fn has(&self, path: &str) -> bool {
        self.records.lock().unwrap().contains_key(path)
    }

    /// Returns true when a record was removed
    pub fn delete(&self, path: &str) -> bool {
        self.records.lock().unwrap().remove(path).is_some()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached paths, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}
