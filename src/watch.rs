//! Bridge between OS file notifications and the node tree.
//!
//! Loaded directories are registered non-recursively with one process-wide
//! watcher. Incoming events are normalized into [`PathChange`] batches and
//! applied under the tree coordination lock, the same lock directory
//! listings run under, so a listing and an event for the same directory can
//! never interleave.
//!
//! Event application is idempotent against listing races: a create event
//! for a child the listing already produced is dropped, a modify event
//! whose metadata snapshot equals the stored one is dropped.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::attrs::PathAttributes;
use crate::config::should_ignore;
use crate::model::ModelCtx;
use crate::node::PathNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// One normalized filesystem change. Renames arrive as a delete of the old
/// path followed by a create of the new one.
#[derive(Debug, Clone)]
pub(crate) struct PathChange {
    pub(crate) kind: ChangeKind,
    pub(crate) path: PathBuf,
}

pub(crate) struct WatchBridge {
    watcher: Mutex<RecommendedWatcher>,
    watched: Mutex<HashSet<PathBuf>>,
}

impl WatchBridge {
    pub(crate) fn new(ctx: Weak<ModelCtx>, ignore: Vec<String>) -> notify::Result<Self> {
        let watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    tracing::debug!(error = %e, "watch backend error");
                    return;
                }
            };
            let Some(ctx) = ctx.upgrade() else {
                return;
            };
            let changes: Vec<PathChange> = classify(&event)
                .into_iter()
                .filter(|c| !should_ignore(&c.path, &ignore))
                .collect();
            if !changes.is_empty() {
                apply_batch(&ctx, changes);
            }
        })?;

        Ok(Self {
            watcher: Mutex::new(watcher),
            watched: Mutex::new(HashSet::new()),
        })
    }

    /// Subscribe a directory for non-recursive change notification.
    ///
    /// The path is canonicalized first so the watch key matches what the
    /// backend reports; the canonical path is returned for the caller to
    /// adopt. Registering an already-watched directory is a no-op.
    pub(crate) fn register(&self, path: &Path) -> notify::Result<PathBuf> {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        let mut watched = self.watched.lock().unwrap();
        if !watched.insert(canonical.clone()) {
            return Ok(canonical);
        }
        if let Err(e) = self
            .watcher
            .lock()
            .unwrap()
            .watch(&canonical, RecursiveMode::NonRecursive)
        {
            watched.remove(&canonical);
            return Err(e);
        }
        Ok(canonical)
    }

    /// Drop the subscription for a directory, if any.
    pub(crate) fn unregister(&self, path: &Path) {
        let mut watched = self.watched.lock().unwrap();
        if watched.remove(path) {
            // The backend drops the watch itself when the directory is gone.
            let _ = self.watcher.lock().unwrap().unwatch(path);
        }
    }

    /// Whether a directory is already registered. Touches only the watched
    /// set, never the backend, so it is safe on the event thread.
    pub(crate) fn is_watched(&self, path: &Path) -> bool {
        self.watched.lock().unwrap().contains(path)
    }
}

/// Normalize a backend event into path changes.
fn classify(event: &notify::Event) -> Vec<PathChange> {
    let change = |kind: ChangeKind| {
        event
            .paths
            .iter()
            .map(|p| PathChange {
                kind,
                path: p.clone(),
            })
            .collect::<Vec<_>>()
    };

    match event.kind {
        EventKind::Create(_) => change(ChangeKind::Created),
        EventKind::Remove(_) => change(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => change(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => change(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut changes = Vec::new();
            if let Some(from) = event.paths.first() {
                changes.push(PathChange {
                    kind: ChangeKind::Deleted,
                    path: from.clone(),
                });
            }
            if let Some(to) = event.paths.get(1) {
                changes.push(PathChange {
                    kind: ChangeKind::Created,
                    path: to.clone(),
                });
            }
            changes
        }
        EventKind::Modify(_) => change(ChangeKind::Modified),
        _ => Vec::new(),
    }
}

/// Apply a batch of changes to the tree under the coordination lock.
///
/// Modification callbacks are fired after the lock is released; deletion
/// callbacks fire inside it, matching owner-initiated deletion.
pub(crate) fn apply_batch(ctx: &Arc<ModelCtx>, changes: Vec<PathChange>) {
    let mut modified: Vec<Arc<PathNode>> = Vec::new();
    {
        let _guard = ctx.tree_lock.lock().unwrap();
        for change in changes {
            apply_one_locked(ctx, &change, &mut modified);
        }
    }
    for node in modified {
        node.fire_modified();
    }
}

fn apply_one_locked(ctx: &Arc<ModelCtx>, change: &PathChange, modified: &mut Vec<Arc<PathNode>>) {
    match change.kind {
        ChangeKind::Created => {
            let Some(parent_path) = change.path.parent() else {
                return;
            };
            // Only materialize under a directory the model already tracks.
            let Some(parent) = ctx.cache.lookup(parent_path) else {
                return;
            };
            if parent.is_deleted() || parent.has_child_path(&change.path) {
                return;
            }
            let is_dir = change.path.is_dir();
            parent.adopt_created_locked(&change.path, is_dir);
            tracing::trace!(path = %change.path.display(), "adopted created entry");
        }
        ChangeKind::Modified => {
            let Some(node) = ctx.cache.lookup(&change.path) else {
                return;
            };
            if node.is_deleted() || !change.path.exists() {
                return;
            }
            let fresh = PathAttributes::snapshot(&change.path);
            let stored = node.attributes();
            if fresh.modified != stored.modified || fresh.size != stored.size {
                node.set_attributes(fresh);
                modified.push(node);
            }
        }
        ChangeKind::Deleted => {
            let Some(node) = ctx.cache.lookup(&change.path) else {
                return;
            };
            if node.is_deleted() {
                return;
            }
            node.delete_externally_locked();
            tracing::trace!(path = %change.path.display(), "applied external deletion");
        }
    }
}
