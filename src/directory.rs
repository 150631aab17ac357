//! Boundary with the coordination store.
//!
//! A [`Directory`] delivers everything it observes as [`DirectoryEvent`]s on
//! a single channel handed out at construction. The tree cache is the only
//! consumer; it calls [`Directory::watch`] for every node it mirrors and
//! keeps the returned [`WatchHandle`] for as long as the node lives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Notifications produced by a directory client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// A new session was established (initial connect or reconnect).
    /// Watches armed on earlier sessions are gone.
    SessionEstablished,
    /// The session was lost.
    Disconnected,
    /// Current payload of a watched node.
    DataChanged {
        /// Store path of the node.
        path: String,
        /// Raw payload; empty if the node has none.
        data: Vec<u8>,
    },
    /// Current child names of a watched node.
    ChildrenChanged {
        /// Store path of the node.
        path: String,
        /// Leaf names of the node's immediate children.
        children: Vec<String>,
    },
}

impl DirectoryEvent {
    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionEstablished => "session_established",
            Self::Disconnected => "disconnected",
            Self::DataChanged { .. } => "data_changed",
            Self::ChildrenChanged { .. } => "children_changed",
        }
    }
}

/// A coordination-store client.
pub trait Directory: Send + Sync {
    /// Arm a data watch and a children watch on `path`.
    ///
    /// The current payload and child list are delivered as events, then one
    /// event per subsequent change, until the returned handle is dropped or
    /// the session ends.
    fn watch(&self, path: &str) -> WatchHandle;
}

/// Shared liveness flag between a [`WatchHandle`] and the client-side task
/// that services it.
#[derive(Debug, Clone)]
pub struct WatchToken(Arc<AtomicBool>);

impl WatchToken {
    /// True until the owning handle is dropped.
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A live subscription on one path. Dropping it cancels the subscription.
#[derive(Debug)]
pub struct WatchHandle {
    path: String,
    token: WatchToken,
}

impl WatchHandle {
    /// Create a handle for `path` and the token its servicing side polls.
    pub fn new(path: impl Into<String>) -> (Self, WatchToken) {
        let token = WatchToken(Arc::new(AtomicBool::new(true)));
        let handle = Self {
            path: path.into(),
            token: token.clone(),
        };
        (handle, token)
    }

    /// The watched path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// True until dropped.
    pub fn is_active(&self) -> bool {
        self.token.is_active()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.token.0.store(false, Ordering::Release);
    }
}
