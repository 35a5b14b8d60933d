//! Weak-lifetime registry mapping a filesystem path to exactly one shared
//! [`PathNode`].
//!
//! The cache holds only `Weak` handles: an entry lives exactly as long as
//! some external owner (a parent node, a UI element, a pending callback)
//! keeps the `Arc` alive. A lookup for a reclaimed path transparently
//! constructs a fresh node — callers never observe a missing result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::model::ModelCtx;
use crate::node::PathNode;

/// How many cache operations between opportunistic purges of dead entries.
const PURGE_INTERVAL: usize = 64;

pub(crate) struct PathCache {
    map: Mutex<HashMap<PathBuf, Weak<PathNode>>>,
    ops: AtomicUsize,
}

impl PathCache {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            ops: AtomicUsize::new(0),
        }
    }

    /// Return the node for `path`, constructing and registering one if no
    /// live node exists.
    ///
    /// `parent`, when given, is linked into the node's parent set. Watch
    /// re-subscription is the caller's concern: this may run with the tree
    /// lock held, where touching the watch backend is not allowed.
    pub(crate) fn get(
        &self,
        ctx: &Arc<ModelCtx>,
        parent: Option<&Arc<PathNode>>,
        path: &Path,
        is_dir: bool,
    ) -> Arc<PathNode> {
        let node = {
            let mut map = self.map.lock().unwrap();
            match map.get(path).and_then(Weak::upgrade) {
                Some(node) => node,
                None => {
                    // Either never cached or reclaimed; recreate transparently.
                    let node = PathNode::new_real(ctx, path, is_dir);
                    map.insert(path.to_path_buf(), Arc::downgrade(&node));
                    node
                }
            }
        };

        if let Some(parent) = parent {
            node.link_parent(parent);
        }

        self.maybe_purge();
        node
    }

    /// Look up a live node without constructing one.
    pub(crate) fn lookup(&self, path: &Path) -> Option<Arc<PathNode>> {
        self.map.lock().unwrap().get(path).and_then(Weak::upgrade)
    }

    /// Register `node` under `path`, replacing any previous entry.
    pub(crate) fn insert(&self, path: &Path, node: &Arc<PathNode>) {
        self.map
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), Arc::downgrade(node));
    }

    /// Drop the cache slot for `path` unconditionally.
    pub(crate) fn remove(&self, path: &Path) {
        self.map.lock().unwrap().remove(path);
    }

    /// Atomically re-key `node` from `old_path` to its location under
    /// `new_path` (used by rename/move/save before the node's own path is
    /// updated by the caller).
    pub(crate) fn rekey(&self, old_path: &Path, new_path: &Path, node: &Arc<PathNode>) {
        let mut map = self.map.lock().unwrap();
        map.remove(old_path);
        map.insert(new_path.to_path_buf(), Arc::downgrade(node));
    }

    /// Number of live entries (dead weak slots excluded).
    pub(crate) fn live_len(&self) -> usize {
        self.map
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Drop all entries whose node has been reclaimed. Returns the number
    /// of slots removed.
    pub(crate) fn purge(&self) -> usize {
        let mut map = self.map.lock().unwrap();
        let before = map.len();
        map.retain(|_, w| w.strong_count() > 0);
        let removed = before - map.len();
        if removed > 0 {
            tracing::debug!(removed, "purged reclaimed cache entries");
        }
        removed
    }

    fn maybe_purge(&self) {
        if self.ops.fetch_add(1, Ordering::Relaxed) % PURGE_INTERVAL == PURGE_INTERVAL - 1 {
            self.purge();
        }
    }
}
