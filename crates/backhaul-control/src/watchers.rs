//! Lifecycle watcher tracking
//!
//! One watcher task runs per registered endpoint, blocked on that backend's
//! death signal. Handles are kept here so service shutdown can abort waits
//! that would otherwise never return, and so an eviction can cancel the
//! watcher of the endpoint it removed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinHandle;

use crate::registry::Endpoint;

/// Tracks the lifecycle watcher task of each registered endpoint
pub struct WatcherSet {
    watchers: Mutex<HashMap<u32, WatcherEntry>>,
}

struct WatcherEntry {
    /// Which endpoint instance the task watches. A recycled pid gets a fresh
    /// entry, and the old instance must not be able to abort it.
    endpoint: Weak<Endpoint>,
    handle: JoinHandle<()>,
}

impl WatcherSet {
    pub fn new() -> Self {
        Self {
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Track the watcher for an endpoint, aborting any leftover task still
    /// registered under the same pid.
    pub fn register(&self, endpoint: &Arc<Endpoint>, handle: JoinHandle<()>) {
        if let Ok(mut watchers) = self.watchers.lock() {
            let entry = WatcherEntry {
                endpoint: Arc::downgrade(endpoint),
                handle,
            };
            if let Some(old) = watchers.insert(endpoint.pid, entry) {
                old.handle.abort();
            }
        }
    }

    /// Stop tracking and abort the watcher of this endpoint instance.
    ///
    /// A no-op when the pid is by now tracked for a different instance.
    pub fn unregister(&self, endpoint: &Arc<Endpoint>) {
        if let Ok(mut watchers) = self.watchers.lock() {
            let is_current = watchers
                .get(&endpoint.pid)
                .map(|entry| entry.endpoint.as_ptr() == Arc::as_ptr(endpoint))
                .unwrap_or(false);
            if is_current {
                if let Some(entry) = watchers.remove(&endpoint.pid) {
                    entry.handle.abort();
                }
            }
        }
    }

    /// Abort every tracked watcher; used at service shutdown.
    pub fn abort_all(&self) {
        if let Ok(mut watchers) = self.watchers.lock() {
            for (_, entry) in watchers.drain() {
                entry.handle.abort();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.watchers.lock().map(|watchers| watchers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WatcherSet {
    fn default() -> Self {
        Self::new()
    }
}
