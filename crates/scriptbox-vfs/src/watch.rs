// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path watching for the virtual filesystem

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::path;

/// Kind of change reported to watchers.
///
/// `Rename` covers entries appearing, disappearing or moving; `Change`
/// covers content and metadata updates of an existing entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Change,
    Rename,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// Absolute path of the entry that changed
    pub path: String,
}

/// Receiver of watch events
pub trait WatchListener: Send + Sync {
    fn on_event(&self, evt: &WatchEvent);
}

impl<F> WatchListener for F
where
    F: Fn(&WatchEvent) + Send + Sync,
{
    fn on_event(&self, evt: &WatchEvent) {
        self(evt)
    }
}

/// Opaque watch registration identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

struct Watcher {
    path: String,
    recursive: bool,
    listener: Arc<dyn WatchListener>,
}

impl Watcher {
    fn matches(&self, changed: &str) -> bool {
        if !path::is_within(changed, &self.path) {
            return false;
        }
        self.recursive || changed == self.path || path::dirname(changed) == self.path
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    watchers: HashMap<WatchId, Watcher>,
}

/// Table of active watchers, shared with the handles it hands out
#[derive(Clone, Default)]
pub(crate) struct WatchRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl WatchRegistry {
    pub(crate) fn register(
        &self,
        path: String,
        recursive: bool,
        listener: Arc<dyn WatchListener>,
    ) -> WatchHandle {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = WatchId(inner.next_id);
        inner.watchers.insert(
            id,
            Watcher {
                path,
                recursive,
                listener,
            },
        );
        WatchHandle {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().watchers.len()
    }

    /// Deliver events to every matching listener. Listeners run after the
    /// registry lock is released so they may call back into the filesystem.
    pub(crate) fn dispatch(&self, events: &[WatchEvent]) {
        if events.is_empty() {
            return;
        }
        let targets: Vec<(Arc<dyn WatchListener>, Vec<WatchEvent>)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .watchers
                .values()
                .filter_map(|w| {
                    let matching: Vec<WatchEvent> =
                        events.iter().filter(|e| w.matches(&e.path)).cloned().collect();
                    (!matching.is_empty()).then(|| (w.listener.clone(), matching))
                })
                .collect()
        };
        for (listener, matching) in targets {
            for evt in &matching {
                listener.on_event(evt);
            }
        }
    }
}

/// Disposable watch registration; unregisters on [`WatchHandle::close`] or drop
pub struct WatchHandle {
    id: WatchId,
    registry: Weak<Mutex<RegistryInner>>,
}

impl WatchHandle {
    pub fn id(&self) -> WatchId {
        self.id
    }

    pub fn close(self) {}
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().unwrap().watchers.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").field("id", &self.id).finish()
    }
}
