//! In-process [`Directory`] implementation.
//!
//! Holds a path tree in memory and honours the same watch contract as the
//! ZooKeeper client: current values are delivered when a watch is armed,
//! every later change is delivered while the handle is alive, and watches
//! do not survive [`MemoryDirectory::establish_session`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::directory::{Directory, DirectoryEvent, WatchHandle, WatchToken};

/// An in-memory directory.
#[derive(Debug, Clone)]
pub struct MemoryDirectory {
    inner: Arc<Mutex<MemoryState>>,
    events: mpsc::UnboundedSender<DirectoryEvent>,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// path -> payload
    nodes: BTreeMap<String, Vec<u8>>,
    /// Watches armed during the current session.
    watches: Vec<(String, WatchToken)>,
    connected: bool,
    registrations: usize,
}

fn parent_of(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    (idx > 0).then(|| &path[..idx])
}

fn ancestors_of(path: &str) -> Vec<&str> {
    let mut ancestors = Vec::new();
    let mut current = path;
    while let Some(parent) = parent_of(current) {
        ancestors.push(parent);
        current = parent;
    }
    ancestors.reverse();
    ancestors
}

impl MemoryState {
    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let leaf = &key[prefix.len()..];
                (!leaf.contains('/')).then(|| leaf.to_string())
            })
            .collect()
    }

    fn is_watched(&mut self, path: &str) -> bool {
        self.watches.retain(|(_, token)| token.is_active());
        self.watches.iter().any(|(watched, _)| watched == path)
    }
}

impl MemoryDirectory {
    /// Create an empty, disconnected directory and its event stream.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DirectoryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let directory = Self {
            inner: Arc::new(Mutex::new(MemoryState::default())),
            events,
        };
        (directory, rx)
    }

    /// Start a new session. Every previously armed watch is forgotten.
    pub fn establish_session(&self) {
        let mut state = self.inner.lock();
        state.watches.clear();
        state.connected = true;
        let _ = self.events.send(DirectoryEvent::SessionEstablished);
    }

    /// Lose the session. Changes made while disconnected are stored but not
    /// delivered.
    pub fn disconnect(&self) {
        let mut state = self.inner.lock();
        state.connected = false;
        let _ = self.events.send(DirectoryEvent::Disconnected);
    }

    /// Create or replace the node at `path`, creating missing ancestors with
    /// empty payloads.
    pub fn put(&self, path: &str, data: impl Into<Vec<u8>>) {
        let mut state = self.inner.lock();
        let mut data_changed = BTreeSet::new();
        let mut children_changed = BTreeSet::new();

        for ancestor in ancestors_of(path) {
            if !state.nodes.contains_key(ancestor) {
                state.nodes.insert(ancestor.to_string(), Vec::new());
                data_changed.insert(ancestor.to_string());
                if let Some(parent) = parent_of(ancestor) {
                    children_changed.insert(parent.to_string());
                }
            }
        }

        if state.nodes.insert(path.to_string(), data.into()).is_none() {
            if let Some(parent) = parent_of(path) {
                children_changed.insert(parent.to_string());
            }
            children_changed.insert(path.to_string());
        }
        data_changed.insert(path.to_string());

        self.notify(&mut state, &data_changed, &children_changed);
    }

    /// Convenience for JSON payloads.
    pub fn put_json(&self, path: &str, value: &serde_json::Value) {
        self.put(path, value.to_string());
    }

    /// Remove the node at `path` and its whole subtree.
    pub fn remove(&self, path: &str) {
        let mut state = self.inner.lock();
        let prefix = format!("{path}/");
        let before = state.nodes.len();
        state
            .nodes
            .retain(|key, _| key != path && !key.starts_with(&prefix));
        if state.nodes.len() == before {
            return;
        }

        let mut children_changed = BTreeSet::new();
        if let Some(parent) = parent_of(path) {
            children_changed.insert(parent.to_string());
        }
        self.notify(&mut state, &BTreeSet::new(), &children_changed);
    }

    /// Total number of watches ever armed through this directory.
    pub fn registrations(&self) -> usize {
        self.inner.lock().registrations
    }

    /// Number of watches currently alive.
    pub fn active_watches(&self) -> usize {
        let mut state = self.inner.lock();
        state.watches.retain(|(_, token)| token.is_active());
        state.watches.len()
    }

    fn notify(
        &self,
        state: &mut MemoryState,
        data_changed: &BTreeSet<String>,
        children_changed: &BTreeSet<String>,
    ) {
        if !state.connected {
            return;
        }
        for path in data_changed {
            if state.is_watched(path) {
                if let Some(data) = state.nodes.get(path) {
                    let _ = self.events.send(DirectoryEvent::DataChanged {
                        path: path.clone(),
                        data: data.clone(),
                    });
                }
            }
        }
        for path in children_changed {
            if state.is_watched(path) && state.nodes.contains_key(path) {
                let children = state.children_of(path);
                let _ = self.events.send(DirectoryEvent::ChildrenChanged {
                    path: path.clone(),
                    children,
                });
            }
        }
    }
}

impl Directory for MemoryDirectory {
    fn watch(&self, path: &str) -> WatchHandle {
        let (handle, token) = WatchHandle::new(path);
        let mut state = self.inner.lock();
        state.registrations += 1;
        if !state.connected {
            return handle;
        }
        trace!(path, "arming memory watch");
        state.watches.push((path.to_string(), token));

        if let Some(data) = state.nodes.get(path).cloned() {
            let children = state.children_of(path);
            let _ = self.events.send(DirectoryEvent::DataChanged {
                path: path.to_string(),
                data,
            });
            let _ = self.events.send(DirectoryEvent::ChildrenChanged {
                path: path.to_string(),
                children,
            });
        }
        handle
    }
}
