//! In-memory mirror of the directory subtree under the root domain.
//!
//! Every mirrored path is a [`TreeNode`] held behind an `Arc` in a single
//! index keyed by lowercase domain name. Directory events are applied under
//! one write lock and replace whole `Arc`s, so a reader holding a node never
//! sees it change underneath it and never observes a partially applied
//! event.
//!
//! Each live node owns exactly one [`WatchHandle`]. Pruning a node drops its
//! handle, which cancels the subscription.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, trace, warn};

use crate::directory::{Directory, DirectoryEvent, WatchHandle};
use crate::metrics;
use crate::name::{child_path, domain_to_path, path_to_domain};
use crate::record::Record;

/// One mirrored directory path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    /// Leaf name as stored in the directory.
    pub name: String,
    /// Full lowercase domain; the index key.
    pub domain: String,
    /// Store path.
    pub path: String,
    /// Parsed payload, `None` until fetched or when the node has none.
    pub data: Option<Arc<Record>>,
    /// Leaf names of the immediate children.
    pub children: BTreeSet<String>,
}

impl TreeNode {
    fn new(name: &str, domain: String, path: String) -> Self {
        Self {
            name: name.to_string(),
            domain,
            path,
            data: None,
            children: BTreeSet::new(),
        }
    }

    fn child_domain(&self, leaf: &str) -> String {
        format!("{}.{}", leaf.to_ascii_lowercase(), self.domain)
    }
}

/// Thread-safe tree cache.
#[derive(Clone)]
pub struct TreeCache {
    inner: Arc<RwLock<TreeState>>,
    directory: Arc<dyn Directory>,
}

#[derive(Debug)]
struct TreeState {
    root_domain: String,

    /// domain -> node
    nodes: HashMap<String, Arc<TreeNode>>,

    /// address -> domains of host-like records registered at it
    reverse: HashMap<Ipv4Addr, BTreeSet<String>>,

    /// domain -> live subscription
    watches: HashMap<String, WatchHandle>,

    /// True once the root received data during the current session.
    ready: bool,
}

impl fmt::Debug for TreeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("TreeCache")
            .field("root_domain", &inner.root_domain)
            .field("nodes", &inner.nodes.len())
            .field("ready", &inner.ready)
            .finish()
    }
}

impl TreeCache {
    /// Create a cache mirroring `root_domain`.
    ///
    /// Nothing is watched until the directory reports a session.
    pub fn new(directory: Arc<dyn Directory>, root_domain: &str) -> Self {
        let root_domain = root_domain.trim_end_matches('.').to_ascii_lowercase();
        let root_path = domain_to_path(&root_domain);
        let leaf = root_domain
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();
        let root = TreeNode::new(&leaf, root_domain.clone(), root_path);

        let mut nodes = HashMap::new();
        nodes.insert(root_domain.clone(), Arc::new(root));

        Self {
            inner: Arc::new(RwLock::new(TreeState {
                root_domain,
                nodes,
                reverse: HashMap::new(),
                watches: HashMap::new(),
                ready: false,
            })),
            directory,
        }
    }

    /// The mirrored root domain.
    pub fn root_domain(&self) -> String {
        self.inner.read().root_domain.clone()
    }

    /// True once the root node has received data during the current session.
    pub fn is_ready(&self) -> bool {
        self.inner.read().ready
    }

    /// Exact-match lookup by lowercase domain.
    pub fn lookup(&self, domain: &str) -> Option<Arc<TreeNode>> {
        self.inner.read().nodes.get(domain).cloned()
    }

    /// The live children of `node`, in leaf-name order.
    pub fn children(&self, node: &TreeNode) -> Vec<Arc<TreeNode>> {
        let inner = self.inner.read();
        node.children
            .iter()
            .filter_map(|leaf| inner.nodes.get(&node.child_domain(leaf)).cloned())
            .collect()
    }

    /// Nodes whose host-like record is registered at `addr`.
    pub fn reverse_lookup(&self, addr: Ipv4Addr) -> Vec<Arc<TreeNode>> {
        let inner = self.inner.read();
        inner
            .reverse
            .get(&addr)
            .into_iter()
            .flatten()
            .filter_map(|domain| inner.nodes.get(domain).cloned())
            .collect()
    }

    /// Number of mirrored nodes, root included.
    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    /// True if only the root is mirrored.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Number of live subscriptions held by the cache.
    pub fn watch_count(&self) -> usize {
        self.inner.read().watches.len()
    }

    /// Emit current tree metrics.
    pub fn emit_metrics(&self) {
        let inner = self.inner.read();
        metrics::record_tree_state(inner.nodes.len(), inner.reverse.len(), inner.ready);
    }

    /// Apply one directory event.
    pub fn apply(&self, event: DirectoryEvent) {
        metrics::record_tree_event(event.kind());
        let mut inner = self.inner.write();
        match event {
            DirectoryEvent::SessionEstablished => self.on_session_established(&mut inner),
            DirectoryEvent::Disconnected => {
                warn!(
                    nodes = inner.nodes.len(),
                    "directory session lost, serving stale tree"
                );
                metrics::record_session(metrics::SessionTransition::Lost);
            }
            DirectoryEvent::DataChanged { path, data } => {
                Self::on_data_changed(&mut inner, &path, &data)
            }
            DirectoryEvent::ChildrenChanged { path, children } => {
                self.on_children_changed(&mut inner, &path, children)
            }
        }
    }

    fn on_session_established(&self, inner: &mut TreeState) {
        inner.ready = false;
        inner.watches.clear();

        let nodes: Vec<(String, String)> = inner
            .nodes
            .values()
            .map(|node| (node.domain.clone(), node.path.clone()))
            .collect();
        for (domain, path) in nodes {
            let handle = self.directory.watch(&path);
            inner.watches.insert(domain, handle);
        }

        info!(
            nodes = inner.watches.len(),
            "directory session established, rebound watches"
        );
        metrics::record_session(metrics::SessionTransition::Established);
    }

    fn on_data_changed(inner: &mut TreeState, path: &str, data: &[u8]) {
        let domain = path_to_domain(path);
        let Some(node) = inner.nodes.get(&domain) else {
            trace!(path, "data for unknown path, ignoring");
            return;
        };
        if node.path != path {
            trace!(path, "data for shadowed path, ignoring");
            return;
        }

        let record = match Record::parse(data) {
            Ok(record) => record.map(Arc::new),
            Err(e) => {
                error!(
                    path,
                    error = %e,
                    record = %String::from_utf8_lossy(data),
                    "malformed record payload, keeping previous data"
                );
                metrics::record_malformed_payload();
                return;
            }
        };

        if let Some(Record::Invalid {
            type_name, reason, ..
        }) = record.as_deref()
        {
            error!(
                path,
                record_type = ?type_name,
                reason = %reason,
                record = %String::from_utf8_lossy(data),
                "invalid record in directory"
            );
        }

        let old_addr = node.data.as_ref().and_then(|r| r.host_address());
        let new_addr = record.as_ref().and_then(|r| r.host_address());
        if old_addr != new_addr {
            if let Some(addr) = old_addr {
                remove_reverse(&mut inner.reverse, addr, &domain);
            }
            if let Some(addr) = new_addr {
                inner
                    .reverse
                    .entry(addr)
                    .or_default()
                    .insert(domain.clone());
            }
        }

        let updated = TreeNode {
            data: record,
            ..TreeNode::clone(node)
        };
        debug!(path, data = ?updated.data, "updated node data");
        inner.nodes.insert(domain.clone(), Arc::new(updated));

        if domain == inner.root_domain && !inner.ready {
            info!(root = %domain, "tree cache ready");
            inner.ready = true;
        }
    }

    fn on_children_changed(&self, inner: &mut TreeState, path: &str, children: Vec<String>) {
        let domain = path_to_domain(path);
        let Some(node) = inner.nodes.get(&domain).cloned() else {
            trace!(path, "children for unknown path, ignoring");
            return;
        };
        if node.path != path {
            trace!(path, "children for shadowed path, ignoring");
            return;
        }

        let new: BTreeSet<String> = children.into_iter().collect();
        if new == node.children {
            trace!(path, "children unchanged");
            return;
        }

        for leaf in node.children.difference(&new) {
            Self::prune(inner, &node.child_domain(leaf));
        }

        let mut children = BTreeSet::new();
        for leaf in &new {
            let child_domain = node.child_domain(leaf);
            if node.children.contains(leaf) {
                children.insert(leaf.clone());
                continue;
            }
            if inner.nodes.contains_key(&child_domain) {
                warn!(path, leaf = %leaf, "child name collides with an existing node, skipping");
                continue;
            }

            let child_path = child_path(&node.path, leaf);
            let handle = self.directory.watch(&child_path);
            inner.watches.insert(child_domain.clone(), handle);
            inner.nodes.insert(
                child_domain.clone(),
                Arc::new(TreeNode::new(leaf, child_domain, child_path)),
            );
            children.insert(leaf.clone());
        }

        debug!(path, children = children.len(), "updated node children");
        let updated = TreeNode {
            children,
            ..TreeNode::clone(&node)
        };
        inner.nodes.insert(domain, Arc::new(updated));
    }

    /// Remove `domain` and its whole subtree, cancelling their watches.
    fn prune(inner: &mut TreeState, domain: &str) {
        let Some(node) = inner.nodes.remove(domain) else {
            return;
        };
        inner.watches.remove(domain);
        if let Some(addr) = node.data.as_ref().and_then(|r| r.host_address()) {
            remove_reverse(&mut inner.reverse, addr, domain);
        }
        debug!(path = %node.path, "pruned node");

        for leaf in &node.children {
            Self::prune(inner, &node.child_domain(leaf));
        }
    }
}

fn remove_reverse(reverse: &mut HashMap<Ipv4Addr, BTreeSet<String>>, addr: Ipv4Addr, domain: &str) {
    if let Some(domains) = reverse.get_mut(&addr) {
        domains.remove(domain);
        if domains.is_empty() {
            reverse.remove(&addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDirectory;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup() -> (MemoryDirectory, UnboundedReceiver<DirectoryEvent>, TreeCache) {
        let (dir, rx) = MemoryDirectory::new();
        let cache = TreeCache::new(Arc::new(dir.clone()), "foo.com");
        (dir, rx, cache)
    }

    fn pump(rx: &mut UnboundedReceiver<DirectoryEvent>, cache: &TreeCache) {
        while let Ok(event) = rx.try_recv() {
            cache.apply(event);
        }
    }

    const HOST_A: &str = r#"{"type":"host","host":{"address":"192.168.0.1"}}"#;

    #[test]
    fn test_not_ready_until_root_data() {
        let (dir, mut rx, cache) = setup();
        assert!(!cache.is_ready());

        dir.establish_session();
        pump(&mut rx, &cache);
        assert!(!cache.is_ready());

        dir.put("/com/foo", "");
        pump(&mut rx, &cache);
        assert!(cache.is_ready());
    }

    #[test]
    fn test_mirrors_new_children() {
        let (dir, mut rx, cache) = setup();
        dir.put("/com/foo/hosta", HOST_A);
        dir.establish_session();
        pump(&mut rx, &cache);

        let node = cache.lookup("hosta.foo.com").unwrap();
        assert_eq!(node.name, "hosta");
        assert_eq!(node.path, "/com/foo/hosta");
        assert_eq!(
            node.data.as_ref().unwrap().host_address(),
            Some(Ipv4Addr::new(192, 168, 0, 1))
        );
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.watch_count(), 2);
    }

    #[test]
    fn test_removed_children_are_pruned_recursively() {
        let (dir, mut rx, cache) = setup();
        dir.put("/com/foo/bar/lba", HOST_A);
        dir.establish_session();
        pump(&mut rx, &cache);
        assert!(cache.lookup("lba.bar.foo.com").is_some());
        assert_eq!(cache.reverse_lookup(Ipv4Addr::new(192, 168, 0, 1)).len(), 1);

        dir.remove("/com/foo/bar");
        pump(&mut rx, &cache);
        assert!(cache.lookup("bar.foo.com").is_none());
        assert!(cache.lookup("lba.bar.foo.com").is_none());
        assert!(cache.reverse_lookup(Ipv4Addr::new(192, 168, 0, 1)).is_empty());
        assert_eq!(cache.watch_count(), 1);
        assert_eq!(dir.active_watches(), 1);
    }

    #[test]
    fn test_unchanged_children_event_is_idempotent() {
        let (dir, mut rx, cache) = setup();
        dir.put("/com/foo/bar/lba", HOST_A);
        dir.establish_session();
        pump(&mut rx, &cache);

        let parent = cache.lookup("bar.foo.com").unwrap();
        let child = cache.lookup("lba.bar.foo.com").unwrap();
        let registrations = dir.registrations();

        cache.apply(DirectoryEvent::ChildrenChanged {
            path: "/com/foo/bar".into(),
            children: vec!["lba".into()],
        });

        assert!(Arc::ptr_eq(&parent, &cache.lookup("bar.foo.com").unwrap()));
        assert!(Arc::ptr_eq(&child, &cache.lookup("lba.bar.foo.com").unwrap()));
        assert_eq!(dir.registrations(), registrations);
    }

    #[test]
    fn test_surviving_children_keep_identity() {
        let (dir, mut rx, cache) = setup();
        dir.put("/com/foo/bar/lba", HOST_A);
        dir.establish_session();
        pump(&mut rx, &cache);
        let child = cache.lookup("lba.bar.foo.com").unwrap();

        dir.put("/com/foo/bar/lbb", r#"{"type":"host","host":{"address":"10.0.0.2"}}"#);
        pump(&mut rx, &cache);

        assert!(Arc::ptr_eq(&child, &cache.lookup("lba.bar.foo.com").unwrap()));
        let parent = cache.lookup("bar.foo.com").unwrap();
        assert_eq!(cache.children(&parent).len(), 2);
    }

    #[test]
    fn test_malformed_payload_keeps_previous_data() {
        let (dir, mut rx, cache) = setup();
        dir.put("/com/foo/hosta", HOST_A);
        dir.establish_session();
        pump(&mut rx, &cache);

        dir.put("/com/foo/hosta", "{this is not json");
        pump(&mut rx, &cache);

        let node = cache.lookup("hosta.foo.com").unwrap();
        assert_eq!(
            node.data.as_ref().unwrap().host_address(),
            Some(Ipv4Addr::new(192, 168, 0, 1))
        );
    }

    #[test]
    fn test_malformed_root_does_not_mark_ready() {
        let (dir, mut rx, cache) = setup();
        dir.put("/com/foo", "{garbage");
        dir.establish_session();
        pump(&mut rx, &cache);
        assert!(!cache.is_ready());
    }

    #[test]
    fn test_session_reestablished_rebinds_and_keeps_stale_data() {
        let (dir, mut rx, cache) = setup();
        dir.put("/com/foo/hosta", HOST_A);
        dir.establish_session();
        pump(&mut rx, &cache);
        assert!(cache.is_ready());
        let registrations = dir.registrations();

        dir.disconnect();
        pump(&mut rx, &cache);
        assert!(cache.lookup("hosta.foo.com").is_some());

        // Apply only the session event so the rebind is observable before
        // the fresh data arrives.
        dir.establish_session();
        let event = rx.try_recv().unwrap();
        assert_eq!(event, DirectoryEvent::SessionEstablished);
        cache.apply(event);

        assert!(!cache.is_ready());
        assert!(cache.lookup("hosta.foo.com").is_some());
        assert_eq!(dir.registrations(), registrations + 2);
        assert_eq!(dir.active_watches(), 2);

        pump(&mut rx, &cache);
        assert!(cache.is_ready());
    }

    #[test]
    fn test_reverse_index_follows_address_changes() {
        let (dir, mut rx, cache) = setup();
        dir.put("/com/foo/hosta", HOST_A);
        dir.establish_session();
        pump(&mut rx, &cache);

        dir.put("/com/foo/hosta", r#"{"type":"host","host":{"address":"10.9.9.9"}}"#);
        pump(&mut rx, &cache);

        assert!(cache.reverse_lookup(Ipv4Addr::new(192, 168, 0, 1)).is_empty());
        let hits = cache.reverse_lookup(Ipv4Addr::new(10, 9, 9, 9));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].domain, "hosta.foo.com");
    }

    #[test]
    fn test_mixed_case_children_are_indexed_lowercase() {
        let (dir, mut rx, cache) = setup();
        dir.put("/com/foo/HostA", HOST_A);
        dir.establish_session();
        pump(&mut rx, &cache);

        let node = cache.lookup("hosta.foo.com").unwrap();
        assert_eq!(node.name, "HostA");
        assert_eq!(node.path, "/com/foo/HostA");
    }
}
