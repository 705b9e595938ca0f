// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Ephemeral module resources for the asynchronous dialect.
//!
//! Each asynchronous import materializes its module graph into short-lived
//! resources addressed by `ephemeral:<n>` URLs, plus one temporary global
//! namespace entry through which built-ins are exposed. An [`EphemeralGraph`]
//! owns everything created for one call and releases it when dropped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::exports::Exports;
use crate::host::ImportHost;

pub const URL_SCHEME: &str = "ephemeral:";

pub fn is_ephemeral_url(specifier: &str) -> bool {
    specifier.starts_with(URL_SCHEME)
}

#[derive(Debug, Default)]
pub struct EphemeralStore {
    next_id: AtomicU64,
    resources: Mutex<HashMap<String, String>>,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source` and return its URL
    pub fn create(&self, source: String) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let url = format!("{URL_SCHEME}{id}");
        self.resources.lock().unwrap().insert(url.clone(), source);
        url
    }

    pub fn get(&self, url: &str) -> Option<String> {
        self.resources.lock().unwrap().get(url).cloned()
    }

    pub fn revoke(&self, url: &str) -> bool {
        self.resources.lock().unwrap().remove(url).is_some()
    }

    pub fn live_count(&self) -> usize {
        self.resources.lock().unwrap().len()
    }
}

/// Temporary global entries, each mapping built-in names to their exports
#[derive(Debug, Default)]
pub struct GlobalNamespace {
    entries: Mutex<HashMap<String, BTreeMap<String, Exports>>>,
}

impl GlobalNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, builtins: BTreeMap<String, Exports>) {
        self.entries.lock().unwrap().insert(key.into(), builtins);
    }

    pub fn get(&self, key: &str, name: &str) -> Option<Exports> {
        self.entries.lock().unwrap().get(key)?.get(name).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Module source that re-exports one built-in from a global entry
pub fn builtin_shim_source(global_key: &str, name: &str) -> String {
    // JSON string literals are valid script string literals
    let key = serde_json::Value::from(global_key);
    let name = serde_json::Value::from(name);
    format!("export default globalThis[{key}][{name}];")
}

/// Resources created for one asynchronous import
pub struct EphemeralGraph<'a> {
    store: &'a EphemeralStore,
    globals: &'a GlobalNamespace,
    global_key: String,
    urls: Vec<String>,
    materialized: HashMap<String, String>,
    in_progress: HashSet<String>,
    builtin_urls: HashMap<String, String>,
}

impl<'a> EphemeralGraph<'a> {
    /// Start a graph and publish `builtins` under `global_key`
    pub fn new(
        store: &'a EphemeralStore,
        globals: &'a GlobalNamespace,
        global_key: String,
        builtins: BTreeMap<String, Exports>,
    ) -> Self {
        globals.insert(global_key.clone(), builtins);
        Self {
            store,
            globals,
            global_key,
            urls: Vec::new(),
            materialized: HashMap::new(),
            in_progress: HashSet::new(),
            builtin_urls: HashMap::new(),
        }
    }

    pub fn global_key(&self) -> &str {
        &self.global_key
    }

    /// URL of an already materialized module
    pub fn url_for(&self, path: &str) -> Option<String> {
        self.materialized.get(path).cloned()
    }

    /// Mark `path` as being materialized. False when it already is, which
    /// means the caller reached it through a cycle.
    pub fn begin(&mut self, path: &str) -> bool {
        self.in_progress.insert(path.to_string())
    }

    /// Register the rewritten source of `path` and return its URL
    pub fn finish(&mut self, path: &str, source: String) -> String {
        let url = self.store.create(source);
        self.urls.push(url.clone());
        self.in_progress.remove(path);
        self.materialized.insert(path.to_string(), url.clone());
        url
    }

    /// URL of the shim resource for built-in `name`, created on first use
    pub fn builtin_url(&mut self, name: &str) -> String {
        if let Some(url) = self.builtin_urls.get(name) {
            return url.clone();
        }
        let url = self.store.create(builtin_shim_source(&self.global_key, name));
        self.urls.push(url.clone());
        self.builtin_urls.insert(name.to_string(), url.clone());
        url
    }

    pub fn host(&self) -> ImportHost<'a> {
        ImportHost {
            resources: self.store,
            globals: self.globals,
        }
    }

    pub fn resource_count(&self) -> usize {
        self.urls.len()
    }
}

impl Drop for EphemeralGraph<'_> {
    fn drop(&mut self) {
        for url in self.urls.drain(..) {
            self.store.revoke(&url);
        }
        self.globals.remove(&self.global_key);
        debug!(global_key = %self.global_key, "released ephemeral module graph");
    }
}
