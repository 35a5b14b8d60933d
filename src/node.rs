//! The tree entity: one filesystem path, its children, its attributes, its
//! load state, and its registered lifecycle callbacks.
//!
//! Nodes are handled as `Arc<PathNode>`. The model cache guarantees at most
//! one live node per path, so pointer identity is path identity. A node may
//! have several parents: its real directory plus any number of pseudo-roots
//! aggregating arbitrary path sets.
//!
//! Two child sequences are kept per node. The authoritative sequence is the
//! one mutated by loading, watch events, and explicit operations; the
//! observer-facing sequence mirrors it except while a search traversal has
//! the node marked `searching`, during which mutations are buffered and the
//! mirror is committed when the traversal leaves the node.

use std::cmp::Ordering as CmpOrdering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::attrs::{self, PathAttributes};
use crate::error::{Error, Result};
use crate::loader::Completion;
use crate::model::ModelCtx;

/// Handle for a registered per-node callback, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type VetoFn = Arc<dyn Fn(&Arc<PathNode>) -> bool + Send + Sync>;
type NodeFn = Arc<dyn Fn(&Arc<PathNode>) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    /// Predicates consulted by `not_to_be_deleted`; returning `false`
    /// vetoes removal of the node.
    veto_delete: Vec<(u64, VetoFn)>,
    on_deleted: Vec<(u64, NodeFn)>,
    on_deleted_externally: Vec<(u64, NodeFn)>,
    on_modified: Vec<(u64, NodeFn)>,
}

pub struct PathNode {
    ctx: Arc<ModelCtx>,
    pseudo: bool,
    path: RwLock<PathBuf>,
    name: RwLock<String>,
    directory: AtomicBool,
    attrs: RwLock<PathAttributes>,
    /// Non-owning back-references, used only for detachment bookkeeping.
    parents: Mutex<Vec<Weak<PathNode>>>,
    /// Authoritative child sequence.
    children: Mutex<Vec<Arc<PathNode>>>,
    /// Observer-facing child sequence.
    view: Mutex<Vec<Arc<PathNode>>>,
    loading: AtomicBool,
    loaded: AtomicBool,
    searching: AtomicBool,
    deleted: AtomicBool,
    /// Set on the first external deletion even when the node is retained in
    /// cache by its listeners; duplicate delete events are dropped until
    /// `saved` clears it.
    externally_deleted: AtomicBool,
    leaf: Mutex<Option<bool>>,
    dir_leaf: Mutex<Option<bool>>,
    hooks: Mutex<Hooks>,
}

fn derive_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

impl PathNode {
    pub(crate) fn new_real(ctx: &Arc<ModelCtx>, path: &Path, is_dir: bool) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::clone(ctx),
            pseudo: false,
            path: RwLock::new(path.to_path_buf()),
            name: RwLock::new(derive_name(path)),
            directory: AtomicBool::new(is_dir),
            attrs: RwLock::new(PathAttributes::snapshot(path)),
            parents: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            view: Mutex::new(Vec::new()),
            loading: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            searching: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            externally_deleted: AtomicBool::new(false),
            leaf: Mutex::new(None),
            dir_leaf: Mutex::new(None),
            hooks: Mutex::new(Hooks::default()),
        })
    }

    pub(crate) fn new_pseudo(ctx: &Arc<ModelCtx>) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::clone(ctx),
            pseudo: true,
            path: RwLock::new(PathBuf::new()),
            name: RwLock::new(String::new()),
            directory: AtomicBool::new(false),
            attrs: RwLock::new(PathAttributes {
                size: 0,
                modified: None,
                readable: true,
                directory: false,
                hidden: false,
            }),
            parents: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            view: Mutex::new(Vec::new()),
            loading: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            searching: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            externally_deleted: AtomicBool::new(false),
            leaf: Mutex::new(None),
            dir_leaf: Mutex::new(None),
            hooks: Mutex::new(Hooks::default()),
        })
    }

    /// Adopt a pre-supplied child set into a pseudo-root.
    pub(crate) fn adopt_static(self: &Arc<Self>, children: Vec<Arc<PathNode>>) {
        let has_children = !children.is_empty();
        self.directory.store(has_children, Ordering::SeqCst);
        *self.children.lock().unwrap() = children.clone();
        *self.view.lock().unwrap() = children;
        self.recompute_leaf_from_children();
        self.loaded.store(true, Ordering::SeqCst);
    }

    // ── Read surface ────────────────────────────────────────────────────────

    pub fn path(&self) -> PathBuf {
        self.path.read().unwrap().clone()
    }

    pub fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    pub fn is_directory(&self) -> bool {
        self.directory.load(Ordering::SeqCst)
    }

    pub fn is_file(&self) -> bool {
        !self.is_directory()
    }

    pub fn is_pseudo_root(&self) -> bool {
        self.pseudo
    }

    pub fn is_root(&self) -> bool {
        !self.pseudo && self.path().as_os_str().len() == std::path::MAIN_SEPARATOR.len_utf8()
    }

    /// Live readability probe; pseudo-roots are always readable.
    pub fn is_readable(&self) -> bool {
        self.pseudo || attrs::is_readable(&self.path(), self.is_directory())
    }

    /// The current attribute snapshot.
    pub fn attributes(&self) -> PathAttributes {
        self.attrs.read().unwrap().clone()
    }

    /// Re-snapshot attributes from the filesystem.
    pub fn refresh_attributes(&self) {
        let fresh = PathAttributes::snapshot(&self.path());
        *self.attrs.write().unwrap() = fresh;
    }

    pub(crate) fn set_attributes(&self, attrs: PathAttributes) {
        *self.attrs.write().unwrap() = attrs;
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn is_searching(&self) -> bool {
        self.searching.load(Ordering::SeqCst)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// The observer-facing child sequence.
    pub fn children(&self) -> Vec<Arc<PathNode>> {
        self.view.lock().unwrap().clone()
    }

    /// The authoritative child sequence, as used by re-synchronization and
    /// search traversal.
    pub(crate) fn children_snapshot(&self) -> Vec<Arc<PathNode>> {
        self.children.lock().unwrap().clone()
    }

    /// The first non-pseudo parent, if any.
    pub fn parent(&self) -> Option<Arc<PathNode>> {
        self.parents_live()
            .into_iter()
            .find(|p| !p.is_pseudo_root())
    }

    /// All live parents, pseudo-roots included.
    pub fn parents(&self) -> Vec<Arc<PathNode>> {
        self.parents_live()
    }

    fn parents_live(&self) -> Vec<Arc<PathNode>> {
        let mut parents = self.parents.lock().unwrap();
        parents.retain(|w| w.strong_count() > 0);
        parents.iter().filter_map(Weak::upgrade).collect()
    }

    /// `true` iff the node has no children. For unloaded directories the
    /// filesystem is probed once and the answer cached.
    pub fn is_leaf(&self) -> bool {
        let mut cached = self.leaf.lock().unwrap();
        if let Some(value) = *cached {
            return value;
        }
        let value = self.compute_leaf();
        *cached = Some(value);
        value
    }

    /// `true` iff the node has no directory children. Used to suppress
    /// expand affordances in tree displays.
    pub fn is_dir_leaf(&self) -> bool {
        let mut cached = self.dir_leaf.lock().unwrap();
        if let Some(value) = *cached {
            return value;
        }
        let value = self.compute_dir_leaf();
        *cached = Some(value);
        value
    }

    fn compute_leaf(&self) -> bool {
        if !self.is_directory() || !self.is_readable() {
            return true;
        }
        if self.is_loaded() {
            return self.children.lock().unwrap().is_empty();
        }
        match fs::read_dir(self.path()) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }

    fn compute_dir_leaf(&self) -> bool {
        if !self.is_directory() || !self.is_readable() {
            return true;
        }
        if self.is_loaded() {
            return !self
                .children
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.is_directory());
        }
        match fs::read_dir(self.path()) {
            Ok(entries) => !entries
                .filter_map(|e| e.ok())
                .any(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false)),
            Err(_) => true,
        }
    }

    fn recompute_leaf_from_children(&self) {
        let children = self.children.lock().unwrap();
        *self.leaf.lock().unwrap() = Some(children.is_empty());
        *self.dir_leaf.lock().unwrap() = Some(!children.iter().any(|c| c.is_directory()));
    }

    // ── Parent bookkeeping ──────────────────────────────────────────────────

    pub(crate) fn link_parent(self: &Arc<Self>, parent: &Arc<PathNode>) {
        let mut parents = self.parents.lock().unwrap();
        parents.retain(|w| w.strong_count() > 0);
        let already = parents
            .iter()
            .filter_map(Weak::upgrade)
            .any(|p| Arc::ptr_eq(&p, parent));
        if !already {
            parents.push(Arc::downgrade(parent));
        }
    }

    fn unlink_parent(&self, parent: &Arc<PathNode>) {
        let mut parents = self.parents.lock().unwrap();
        parents.retain(|w| match w.upgrade() {
            Some(p) => !Arc::ptr_eq(&p, parent),
            None => false,
        });
    }

    // ── Loading ─────────────────────────────────────────────────────────────

    /// Trigger an asynchronous directory listing.
    ///
    /// No-op when already loading or loaded, and when the path is
    /// unreadable. Pre-supplied children (the pseudo-root case) are adopted
    /// synchronously. Listing runs on the shared worker pool under the tree
    /// coordination lock, so it never interleaves with watch-event
    /// application. On success the directory is registered for change
    /// notification.
    pub fn load(self: &Arc<Self>) -> Completion {
        if self.is_deleted() {
            return Completion::ready(Err(Error::NodeDeleted(self.path())));
        }
        if self.is_loading() || self.is_loaded() {
            return Completion::ready(Ok(()));
        }
        if (!self.is_directory() && !self.pseudo) || !self.is_readable() {
            return Completion::ready(Ok(()));
        }

        // Children already present (pseudo-root or externally added): adopt.
        {
            let children = self.children.lock().unwrap();
            if !children.is_empty() {
                if !self.is_searching() {
                    *self.view.lock().unwrap() = children.clone();
                }
                drop(children);
                self.mark_loaded();
                return Completion::ready(Ok(()));
            }
        }

        if self
            .loading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Lost the race with another in-flight load.
            return Completion::ready(Ok(()));
        }

        let node = Arc::clone(self);
        self.ctx.loader.run(move || {
            let result = {
                let _guard = node.ctx.tree_lock.lock().unwrap();
                node.list_into_children_locked()
            };
            node.loading.store(false, Ordering::SeqCst);
            match result {
                Ok(()) => {
                    if node.children.lock().unwrap().is_empty() {
                        // An empty child sequence keeps loaded=false; the
                        // watch still covers the directory for creates.
                        node.register_watch();
                    } else {
                        node.mark_loaded();
                    }
                    node.resubscribe_children();
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!(path = %node.path().display(), error = %e, "directory listing failed");
                    Err(e)
                }
            }
        })
    }

    /// List the directory into the authoritative child sequence, sorted
    /// dirs-first then case-insensitive by name. Caller holds the tree lock.
    pub(crate) fn list_into_children_locked(self: &Arc<Self>) -> Result<()> {
        let path = self.path();
        let mut listed = Vec::new();
        for entry in fs::read_dir(&path)? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let child_path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            listed.push(self.ctx.cache.get(&self.ctx, Some(self), &child_path, is_dir));
        }
        listed.sort_by(|a, b| cmp_display(a, b));

        *self.children.lock().unwrap() = listed.clone();
        if !self.is_searching() {
            *self.view.lock().unwrap() = listed;
        }
        self.recompute_leaf_from_children();
        Ok(())
    }

    /// Flip to loaded and register the directory for change notification on
    /// the first transition.
    fn mark_loaded(self: &Arc<Self>) {
        let was_loaded = self.loaded.swap(true, Ordering::SeqCst);
        if !was_loaded && !self.pseudo && self.is_directory() {
            self.register_watch();
        }
    }

    /// Subscribe this directory for change notification. The subscription
    /// may rewrite the path to its canonical key, which the node and the
    /// cache adopt.
    fn register_watch(self: &Arc<Self>) {
        let Some(bridge) = self.ctx.watch_bridge() else {
            return;
        };
        match bridge.register(&self.path()) {
            Ok(canonical) => {
                let current = self.path();
                if canonical != current {
                    self.rekey_subtree(&current, &canonical);
                }
            }
            Err(e) => {
                tracing::debug!(path = %self.path().display(), error = %e, "watch registration failed");
            }
        }
    }

    /// Restore the watch subscription of a loaded directory whose earlier
    /// registration lapsed or failed.
    ///
    /// Callers must not hold the tree lock and must not be on the watch
    /// event thread: `Watcher::watch` round-trips through the backend's
    /// event loop, which itself blocks on the tree lock when applying
    /// changes. The returned canonical path is not adopted here; a loaded
    /// node's path already is the canonical watch key from its first
    /// registration.
    pub(crate) fn resubscribe_watch(self: &Arc<Self>) {
        if self.pseudo || !self.is_directory() || !self.is_loaded() {
            return;
        }
        if let Some(bridge) = self.ctx.watch_bridge() {
            if bridge.is_watched(&self.path()) {
                return;
            }
            if let Err(e) = bridge.register(&self.path()) {
                tracing::debug!(path = %self.path().display(), error = %e, "watch re-registration failed");
            }
        }
    }

    /// Drop children and load state, forcing the next `load` to re-list.
    pub fn refresh(self: &Arc<Self>) {
        let _guard = self.ctx.tree_lock.lock().unwrap();
        let children = std::mem::take(&mut *self.children.lock().unwrap());
        for child in &children {
            child.unlink_parent(self);
        }
        if !self.is_searching() {
            self.view.lock().unwrap().clear();
        }
        self.loading.store(false, Ordering::SeqCst);
        self.loaded.store(false, Ordering::SeqCst);
        *self.leaf.lock().unwrap() = None;
        *self.dir_leaf.lock().unwrap() = None;
    }

    // ── Child mutation ──────────────────────────────────────────────────────

    /// Attach `child` under this node, maintaining parent/child symmetry.
    pub fn add_child(self: &Arc<Self>, child: &Arc<PathNode>) -> Result<()> {
        self.ensure_alive()?;
        let _guard = self.ctx.tree_lock.lock().unwrap();
        self.add_child_locked(child);
        Ok(())
    }

    /// Detach `child` from this node. Other parents keep it.
    pub fn remove_child(self: &Arc<Self>, child: &Arc<PathNode>) -> Result<()> {
        self.ensure_alive()?;
        let _guard = self.ctx.tree_lock.lock().unwrap();
        self.remove_child_locked(child);
        Ok(())
    }

    pub(crate) fn add_child_locked(self: &Arc<Self>, child: &Arc<PathNode>) {
        self.children.lock().unwrap().push(Arc::clone(child));
        if !self.is_searching() {
            self.view.lock().unwrap().push(Arc::clone(child));
        }
        child.link_parent(self);
        self.recompute_leaf_from_children();
        self.loaded.store(true, Ordering::SeqCst);
    }

    pub(crate) fn remove_child_locked(self: &Arc<Self>, child: &Arc<PathNode>) {
        self.children
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, child));
        if !self.is_searching() {
            self.view.lock().unwrap().retain(|c| !Arc::ptr_eq(c, child));
        }
        child.unlink_parent(self);

        if self.children.lock().unwrap().is_empty() {
            *self.leaf.lock().unwrap() = Some(true);
            *self.dir_leaf.lock().unwrap() = Some(true);
            self.loaded.store(false, Ordering::SeqCst);
        } else {
            self.recompute_leaf_from_children();
        }
    }

    /// Whether a child with exactly this path is already attached. Used to
    /// keep watch create-events idempotent against listing races.
    pub(crate) fn has_child_path(&self, path: &Path) -> bool {
        self.children
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.path() == path)
    }

    /// Materialize a freshly created filesystem entry as a child.
    pub fn adopt_created(self: &Arc<Self>, path: &Path, is_dir: bool) -> Result<Arc<PathNode>> {
        self.ensure_alive()?;
        let _guard = self.ctx.tree_lock.lock().unwrap();
        Ok(self.adopt_created_locked(path, is_dir))
    }

    pub(crate) fn adopt_created_locked(self: &Arc<Self>, path: &Path, is_dir: bool) -> Arc<PathNode> {
        let child = self.ctx.cache.get(&self.ctx, Some(self), path, is_dir);
        self.add_child_locked(&child);
        child
    }

    // ── Rename / move ───────────────────────────────────────────────────────

    /// Atomically re-key the node to `new_path`, updating the paths of all
    /// descendants by relativizing against the old root.
    pub fn rename_to(self: &Arc<Self>, new_path: &Path, new_name: &str) -> Result<()> {
        self.ensure_alive()?;
        let _guard = self.ctx.tree_lock.lock().unwrap();
        let old_path = self.path();
        self.ctx.cache.rekey(&old_path, new_path, self);
        *self.path.write().unwrap() = new_path.to_path_buf();
        *self.name.write().unwrap() = new_name.to_string();
        for child in self.children_snapshot() {
            child.rekey_subtree_locked(&old_path, new_path);
        }
        Ok(())
    }

    /// Detach from all real parents, re-key to `new_path`, and reattach
    /// under `new_parent`.
    pub fn move_to(self: &Arc<Self>, new_parent: &Arc<PathNode>, new_path: &Path) -> Result<()> {
        self.ensure_alive()?;
        new_parent.ensure_alive()?;
        let _guard = self.ctx.tree_lock.lock().unwrap();

        for parent in self.parents_live() {
            if !parent.is_pseudo_root() {
                parent.remove_child_locked(self);
            }
        }

        let old_path = self.path();
        self.ctx.cache.rekey(&old_path, new_path, self);
        *self.path.write().unwrap() = new_path.to_path_buf();
        *self.name.write().unwrap() = derive_name(new_path);
        for child in self.children_snapshot() {
            child.rekey_subtree_locked(&old_path, new_path);
        }

        new_parent.add_child_locked(self);
        Ok(())
    }

    /// Rewrite this subtree's paths from under `old_root` to under
    /// `new_root`. Caller holds the tree lock.
    pub(crate) fn rekey_subtree_locked(self: &Arc<Self>, old_root: &Path, new_root: &Path) {
        let my_old = self.path();
        let my_new = if my_old == old_root {
            new_root.to_path_buf()
        } else {
            match my_old.strip_prefix(old_root) {
                Ok(relative) => new_root.join(relative),
                Err(_) => return,
            }
        };
        self.ctx.cache.rekey(&my_old, &my_new, self);
        *self.path.write().unwrap() = my_new.clone();
        *self.name.write().unwrap() = derive_name(&my_new);
        for child in self.children_snapshot() {
            child.rekey_subtree_locked(old_root, new_root);
        }
    }

    pub(crate) fn rekey_subtree(self: &Arc<Self>, old_root: &Path, new_root: &Path) {
        let _guard = self.ctx.tree_lock.lock().unwrap();
        self.rekey_subtree_locked(old_root, new_root);
    }

    /// A file owner re-wrote this entry, possibly under a new path: re-key
    /// the cache entry if needed, refresh attributes, and fire `on_modified`.
    ///
    /// This is also the resurrection path for an externally-deleted node
    /// that was retained in cache by its external-deletion listeners.
    pub fn saved(self: &Arc<Self>, new_path: &Path) -> Result<()> {
        {
            let _guard = self.ctx.tree_lock.lock().unwrap();
            let old_path = self.path();
            if old_path != new_path {
                self.ctx.cache.rekey(&old_path, new_path, self);
                *self.path.write().unwrap() = new_path.to_path_buf();
                *self.name.write().unwrap() = derive_name(new_path);
            } else {
                // May have been evicted by an external delete; restore the slot.
                self.ctx.cache.insert(new_path, self);
            }
            self.deleted.store(false, Ordering::SeqCst);
            self.externally_deleted.store(false, Ordering::SeqCst);
            self.refresh_attributes();
        }
        self.fire_modified();
        Ok(())
    }

    // ── Deletion ────────────────────────────────────────────────────────────

    /// Owner-initiated deletion: fires `on_deleted` and the global listener
    /// list, detaches from all parents, cascades to children, and evicts
    /// this subtree from the cache. Terminal.
    pub fn delete(self: &Arc<Self>) -> Result<()> {
        self.ensure_alive()?;
        let _guard = self.ctx.tree_lock.lock().unwrap();
        self.delete_locked();
        Ok(())
    }

    /// OS-initiated deletion: fires `on_deleted_externally` and the global
    /// listener list. The cache entry is kept while external-deletion
    /// listeners are registered, so the same identity can be resurrected by
    /// a subsequent `saved`.
    pub fn delete_externally(self: &Arc<Self>) -> Result<()> {
        if self.is_deleted() {
            return Err(Error::NodeDeleted(self.path()));
        }
        let _guard = self.ctx.tree_lock.lock().unwrap();
        self.delete_externally_locked();
        Ok(())
    }

    pub(crate) fn delete_locked(self: &Arc<Self>) {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.fire_hooks(|h| h.on_deleted.clone());
        self.ctx.notify_deleted_anywhere(self);
        self.ctx.cache.remove(&self.path());
        self.unregister_watch();
        self.detach_and_cascade(|child| child.delete_locked());
    }

    pub(crate) fn delete_externally_locked(self: &Arc<Self>) {
        // The swap drops duplicate delete events for a node retained in
        // cache, keeping the callbacks fire-exactly-once per deletion.
        if self.is_deleted() || self.externally_deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        let retained = !self.hooks.lock().unwrap().on_deleted_externally.is_empty();
        self.fire_hooks(|h| h.on_deleted_externally.clone());
        self.ctx.notify_deleted_anywhere(self);
        if !retained {
            self.deleted.store(true, Ordering::SeqCst);
            self.ctx.cache.remove(&self.path());
            self.unregister_watch();
        }
        self.detach_and_cascade(|child| child.delete_externally_locked());
    }

    fn detach_and_cascade<F>(self: &Arc<Self>, cascade: F)
    where
        F: Fn(&Arc<PathNode>),
    {
        for parent in self.parents_live() {
            parent.remove_child_locked(self);
        }
        self.parents.lock().unwrap().clear();

        self.loaded.store(false, Ordering::SeqCst);
        self.loading.store(false, Ordering::SeqCst);
        *self.leaf.lock().unwrap() = Some(true);
        *self.dir_leaf.lock().unwrap() = Some(true);

        let children = std::mem::take(&mut *self.children.lock().unwrap());
        if !self.is_searching() {
            self.view.lock().unwrap().clear();
        }
        for child in children {
            child.parents.lock().unwrap().clear();
            cascade(&child);
        }
    }

    fn unregister_watch(&self) {
        if !self.is_directory() {
            return;
        }
        if let Some(bridge) = self.ctx.watch_bridge() {
            bridge.unregister(&self.path());
        }
    }

    /// Pre-flight check for deletion: every node in this subtree whose veto
    /// predicates currently disallow removal.
    pub fn not_to_be_deleted(self: &Arc<Self>) -> Vec<Arc<PathNode>> {
        let mut vetoed = Vec::new();
        self.collect_vetoed(&mut vetoed);
        vetoed
    }

    fn collect_vetoed(self: &Arc<Self>, out: &mut Vec<Arc<PathNode>>) {
        let vetoes: Vec<VetoFn> = self
            .hooks
            .lock()
            .unwrap()
            .veto_delete
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        if vetoes.iter().any(|allow| !allow(self)) {
            out.push(Arc::clone(self));
        }
        for child in self.children_snapshot() {
            child.collect_vetoed(out);
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_deleted() {
            Err(Error::NodeDeleted(self.path()))
        } else {
            Ok(())
        }
    }

    // ── Search coordination ─────────────────────────────────────────────────

    pub(crate) fn begin_search(&self) {
        self.searching.store(true, Ordering::SeqCst);
    }

    /// Leave search mode and commit any mutations buffered while the
    /// traversal held the node.
    pub(crate) fn end_search(&self) {
        self.searching.store(false, Ordering::SeqCst);
        let children = self.children.lock().unwrap().clone();
        *self.view.lock().unwrap() = children;
    }

    /// Ensure children exist for traversal, listing on demand without
    /// marking the node loaded.
    pub(crate) fn list_for_search(self: &Arc<Self>) -> Result<Vec<Arc<PathNode>>> {
        {
            let _guard = self.ctx.tree_lock.lock().unwrap();
            if self.children.lock().unwrap().is_empty() && !self.is_loaded() && !self.pseudo {
                self.list_into_children_locked()?;
            }
        }
        self.resubscribe_children();
        Ok(self.children_snapshot())
    }

    /// Restore lapsed watch subscriptions of loaded directory children.
    /// Runs after a listing, with the tree lock released.
    pub(crate) fn resubscribe_children(self: &Arc<Self>) {
        for child in self.children_snapshot() {
            child.resubscribe_watch();
        }
    }

    // ── Lifecycle callbacks ─────────────────────────────────────────────────

    /// Register a veto predicate consulted by `not_to_be_deleted`.
    /// Returning `false` disallows removal.
    pub fn veto_delete<F>(&self, f: F) -> CallbackId
    where
        F: Fn(&Arc<PathNode>) -> bool + Send + Sync + 'static,
    {
        let id = self.ctx.next_callback_id();
        self.hooks
            .lock()
            .unwrap()
            .veto_delete
            .push((id, Arc::new(f)));
        CallbackId(id)
    }

    /// Register a callback fired on owner-initiated deletion.
    pub fn on_deleted<F>(&self, f: F) -> CallbackId
    where
        F: Fn(&Arc<PathNode>) + Send + Sync + 'static,
    {
        let id = self.ctx.next_callback_id();
        self.hooks.lock().unwrap().on_deleted.push((id, Arc::new(f)));
        CallbackId(id)
    }

    /// Register a callback fired on OS-initiated deletion.
    pub fn on_deleted_externally<F>(&self, f: F) -> CallbackId
    where
        F: Fn(&Arc<PathNode>) + Send + Sync + 'static,
    {
        let id = self.ctx.next_callback_id();
        self.hooks
            .lock()
            .unwrap()
            .on_deleted_externally
            .push((id, Arc::new(f)));
        CallbackId(id)
    }

    /// Register a callback fired when the entry's content changes on disk.
    pub fn on_modified<F>(&self, f: F) -> CallbackId
    where
        F: Fn(&Arc<PathNode>) + Send + Sync + 'static,
    {
        let id = self.ctx.next_callback_id();
        self.hooks
            .lock()
            .unwrap()
            .on_modified
            .push((id, Arc::new(f)));
        CallbackId(id)
    }

    /// Remove a previously registered callback. Returns whether it existed.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut hooks = self.hooks.lock().unwrap();
        let before = hooks.veto_delete.len()
            + hooks.on_deleted.len()
            + hooks.on_deleted_externally.len()
            + hooks.on_modified.len();
        hooks.veto_delete.retain(|(i, _)| *i != id.0);
        hooks.on_deleted.retain(|(i, _)| *i != id.0);
        hooks.on_deleted_externally.retain(|(i, _)| *i != id.0);
        hooks.on_modified.retain(|(i, _)| *i != id.0);
        let after = hooks.veto_delete.len()
            + hooks.on_deleted.len()
            + hooks.on_deleted_externally.len()
            + hooks.on_modified.len();
        before != after
    }

    pub(crate) fn fire_modified(self: &Arc<Self>) {
        self.fire_hooks(|h| h.on_modified.clone());
    }

    fn fire_hooks<F>(self: &Arc<Self>, select: F)
    where
        F: FnOnce(&Hooks) -> Vec<(u64, NodeFn)>,
    {
        // Clone the callback list out so hooks may call back into the node.
        let callbacks = {
            let hooks = self.hooks.lock().unwrap();
            select(&hooks)
        };
        for (_, callback) in callbacks {
            callback(self);
        }
    }
}

impl std::fmt::Debug for PathNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathNode")
            .field("path", &self.path())
            .field("directory", &self.is_directory())
            .field("loaded", &self.is_loaded())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

// ── Display ordering ─────────────────────────────────────────────────────────

/// Default display order: directories before files, then case-insensitive
/// name.
pub fn cmp_display(a: &PathNode, b: &PathNode) -> CmpOrdering {
    b.is_directory()
        .cmp(&a.is_directory())
        .then_with(|| a.name().to_lowercase().cmp(&b.name().to_lowercase()))
}

/// Numeric order by size (largest first), directories still sorted first.
pub fn cmp_by_size(a: &PathNode, b: &PathNode) -> CmpOrdering {
    b.is_directory()
        .cmp(&a.is_directory())
        .then_with(|| b.attributes().size.cmp(&a.attributes().size))
}

/// Numeric order by modification time (newest first), directories still
/// sorted first.
pub fn cmp_by_modified(a: &PathNode, b: &PathNode) -> CmpOrdering {
    b.is_directory()
        .cmp(&a.is_directory())
        .then_with(|| b.attributes().modified.cmp(&a.attributes().modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::PathModel;
    use std::fs::File;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Model with the watcher disabled: these tests drive mutation directly.
    fn test_model() -> PathModel {
        let cfg: ModelConfig =
            toml::from_str("[watcher]\nenabled = false\n[loader]\nmax_parallel = 2").unwrap();
        PathModel::new(cfg)
    }

    fn setup_test_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("alpha")).unwrap();
        fs::create_dir(dir.path().join("Beta")).unwrap();
        File::create(dir.path().join("b.txt")).unwrap();
        File::create(dir.path().join("A.txt")).unwrap();
        fs::create_dir(dir.path().join("alpha").join("nested")).unwrap();
        File::create(dir.path().join("alpha").join("inner.txt")).unwrap();
        dir
    }

    #[test]
    fn identity_same_path_same_node() {
        let dir = setup_test_dir();
        let model = test_model();
        let a = model.get_path(dir.path());
        let b = model.get_path(dir.path());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn reclaimed_when_unreferenced() {
        let dir = setup_test_dir();
        let model = test_model();
        let node = model.get_path(&dir.path().join("A.txt"));
        assert!(model.cached(&dir.path().join("A.txt")).is_some());
        drop(node);
        // The weak slot is dead; lookup must miss and get must recreate.
        assert!(model.cached(&dir.path().join("A.txt")).is_none());
        let again = model.get_path(&dir.path().join("A.txt"));
        assert_eq!(again.name(), "A.txt");
    }

    #[tokio::test]
    async fn load_sorts_dirs_first_then_name_case_insensitive() {
        let dir = setup_test_dir();
        let model = test_model();
        let root = model.get_path(dir.path());
        root.load().wait().await.unwrap();
        assert!(root.is_loaded());

        let names: Vec<String> = root.children().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["alpha", "Beta", "A.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn load_twice_is_noop() {
        let dir = setup_test_dir();
        let model = test_model();
        let root = model.get_path(dir.path());
        root.load().wait().await.unwrap();
        let count = root.children().len();
        root.load().wait().await.unwrap();
        assert_eq!(root.children().len(), count);
    }

    #[tokio::test]
    async fn children_are_deduplicated_through_cache() {
        let dir = setup_test_dir();
        let model = test_model();
        let root = model.get_path(dir.path());
        root.load().wait().await.unwrap();

        let direct = model.get_path(&dir.path().join("alpha"));
        let via_children = root
            .children()
            .into_iter()
            .find(|c| c.name() == "alpha")
            .unwrap();
        assert!(Arc::ptr_eq(&direct, &via_children));
    }

    #[tokio::test]
    async fn leaf_flags_follow_children() {
        let dir = setup_test_dir();
        let model = test_model();
        let root = model.get_path(dir.path());
        root.load().wait().await.unwrap();

        // Root has subdirectories: neither leaf nor dir-leaf.
        assert!(!root.is_leaf());
        assert!(!root.is_dir_leaf());

        let alpha = model.get_path(&dir.path().join("alpha"));
        alpha.load().wait().await.unwrap();
        assert!(!alpha.is_leaf());
        assert!(!alpha.is_dir_leaf()); // has "nested"

        let nested = model.get_path(&dir.path().join("alpha").join("nested"));
        nested.load().wait().await.unwrap();
        assert!(nested.is_leaf());
        assert!(nested.is_dir_leaf());
    }

    #[tokio::test]
    async fn empty_directory_stays_unloaded() {
        let dir = setup_test_dir();
        let model = test_model();
        let nested = model.get_path(&dir.path().join("alpha").join("nested"));
        nested.load().wait().await.unwrap();
        assert!(nested.children().is_empty());
        assert!(nested.is_leaf());
        assert!(!nested.is_loaded());
    }

    #[test]
    fn dir_leaf_probe_without_load() {
        let dir = setup_test_dir();
        let model = test_model();
        let alpha = model.get_path(&dir.path().join("alpha"));
        // Unloaded: answered by filesystem probe.
        assert!(!alpha.is_dir_leaf());
        assert!(!alpha.is_leaf());

        let file = model.get_path(&dir.path().join("A.txt"));
        assert!(file.is_leaf());
        assert!(file.is_dir_leaf());
    }

    #[tokio::test]
    async fn remove_last_child_resets_loaded() {
        let dir = setup_test_dir();
        let model = test_model();
        let nested_dir = dir.path().join("alpha").join("nested");
        File::create(nested_dir.join("only.txt")).unwrap();

        let nested = model.get_path(&nested_dir);
        nested.load().wait().await.unwrap();
        assert!(nested.is_loaded());
        let only = nested.children().pop().unwrap();

        nested.remove_child(&only).unwrap();
        assert!(nested.children().is_empty());
        assert!(nested.is_leaf());
        assert!(!nested.is_loaded());
        assert!(only.parent().is_none());
    }

    #[tokio::test]
    async fn rename_rewrites_descendant_paths() {
        let dir = setup_test_dir();
        let model = test_model();
        let alpha_path = dir.path().join("alpha");
        let alpha = model.get_path(&alpha_path);
        alpha.load().wait().await.unwrap();
        let inner = model.get_path(&alpha_path.join("inner.txt"));

        let new_path = dir.path().join("omega");
        alpha.rename_to(&new_path, "omega").unwrap();

        assert_eq!(alpha.path(), new_path);
        assert_eq!(alpha.name(), "omega");
        assert_eq!(inner.path(), new_path.join("inner.txt"));
        // Identity preserved under the new key.
        let via_cache = model.cached(&new_path.join("inner.txt")).unwrap();
        assert!(Arc::ptr_eq(&via_cache, &inner));
        assert!(model.cached(&alpha_path).is_none());
    }

    #[tokio::test]
    async fn move_reattaches_under_new_parent() {
        let dir = setup_test_dir();
        let model = test_model();
        let root = model.get_path(dir.path());
        root.load().wait().await.unwrap();

        let file = model.get_path(&dir.path().join("A.txt"));
        let beta = model.get_path(&dir.path().join("Beta"));
        let new_path = beta.path().join("A.txt");

        file.move_to(&beta, &new_path).unwrap();
        assert_eq!(file.path(), new_path);
        assert!(beta.children().iter().any(|c| Arc::ptr_eq(c, &file)));
        assert!(!root.children().iter().any(|c| Arc::ptr_eq(c, &file)));
        assert!(Arc::ptr_eq(&file.parent().unwrap(), &beta));
    }

    #[tokio::test]
    async fn delete_fires_hooks_and_cascades() {
        let dir = setup_test_dir();
        let model = test_model();
        let alpha = model.get_path(&dir.path().join("alpha"));
        alpha.load().wait().await.unwrap();
        let inner = model.get_path(&dir.path().join("alpha").join("inner.txt"));

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        alpha.on_deleted(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        let global_fired = Arc::new(AtomicUsize::new(0));
        let global_clone = global_fired.clone();
        let _sub = model.on_deleted_anywhere(move |_| {
            global_clone.fetch_add(1, Ordering::SeqCst);
        });

        alpha.delete().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Global listener sees alpha and each cascaded descendant.
        assert!(global_fired.load(Ordering::SeqCst) >= 2);
        assert!(alpha.is_deleted());
        assert!(inner.is_deleted());
        assert!(model.cached(&dir.path().join("alpha")).is_none());
    }

    #[test]
    fn mutation_on_deleted_node_errors() {
        let dir = setup_test_dir();
        let model = test_model();
        let file = model.get_path(&dir.path().join("A.txt"));
        file.delete().unwrap();
        assert!(matches!(file.delete(), Err(Error::NodeDeleted(_))));
        let other = model.get_path(&dir.path().join("b.txt"));
        assert!(matches!(
            file.rename_to(&dir.path().join("x"), "x"),
            Err(Error::NodeDeleted(_))
        ));
        assert!(matches!(file.add_child(&other), Err(Error::NodeDeleted(_))));
    }

    #[test]
    fn dropped_subscription_stops_global_notifications() {
        let dir = setup_test_dir();
        let model = test_model();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let sub = model.on_deleted_anywhere(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);

        let file = model.get_path(&dir.path().join("A.txt"));
        file.delete().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn external_delete_retains_cache_entry_for_listeners() {
        let dir = setup_test_dir();
        let model = test_model();
        let path = dir.path().join("A.txt");
        let file = model.get_path(&path);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        file.on_deleted_externally(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        file.delete_externally().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Retained: an editor holding this node can still save it back.
        assert!(!file.is_deleted());
        assert!(model.cached(&path).is_some());
    }

    #[test]
    fn retained_external_delete_fires_once_until_saved() {
        let dir = setup_test_dir();
        let model = test_model();
        let path = dir.path().join("A.txt");
        let file = model.get_path(&path);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        file.on_deleted_externally(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        // The retained node stays in cache, so a duplicate event finds it
        // again; it must not re-fire.
        file.delete_externally().unwrap();
        file.delete_externally().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Resurrection re-arms the node for the next deletion.
        fs::write(&path, "restored").unwrap();
        file.saved(&path).unwrap();
        file.delete_externally().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn external_delete_without_listeners_evicts() {
        let dir = setup_test_dir();
        let model = test_model();
        let path = dir.path().join("A.txt");
        let file = model.get_path(&path);
        file.delete_externally().unwrap();
        assert!(file.is_deleted());
        assert!(model.cached(&path).is_none());
    }

    #[test]
    fn saved_resurrects_and_fires_modified() {
        let dir = setup_test_dir();
        let model = test_model();
        let path = dir.path().join("A.txt");
        let file = model.get_path(&path);
        file.on_deleted_externally(|_| {});
        file.delete_externally().unwrap();

        let modified = Arc::new(AtomicUsize::new(0));
        let modified_clone = modified.clone();
        file.on_modified(move |_| {
            modified_clone.fetch_add(1, Ordering::SeqCst);
        });

        fs::write(&path, "back again").unwrap();
        file.saved(&path).unwrap();
        assert_eq!(modified.load(Ordering::SeqCst), 1);
        assert!(!file.is_deleted());
        assert!(model.cached(&path).is_some());
        assert_eq!(file.attributes().size, 10);
    }

    #[test]
    fn veto_marks_subtree_nodes_not_to_be_deleted() {
        let dir = setup_test_dir();
        let model = test_model();
        let alpha = model.get_path(&dir.path().join("alpha"));
        let inner = alpha
            .adopt_created(&dir.path().join("alpha").join("inner.txt"), false)
            .unwrap();
        inner.veto_delete(|_| false);

        let vetoed = alpha.not_to_be_deleted();
        assert_eq!(vetoed.len(), 1);
        assert!(Arc::ptr_eq(&vetoed[0], &inner));

        // Lift the veto by removing the callback.
        let id = vetoed[0].veto_delete(|_| true);
        assert!(inner.remove_callback(id));
    }

    #[tokio::test]
    async fn refresh_forces_relist() {
        let dir = setup_test_dir();
        let model = test_model();
        let root = model.get_path(dir.path());
        root.load().wait().await.unwrap();
        assert_eq!(root.children().len(), 4);

        File::create(dir.path().join("late.txt")).unwrap();
        root.refresh();
        assert!(!root.is_loaded());
        assert!(root.children().is_empty());

        root.load().wait().await.unwrap();
        assert_eq!(root.children().len(), 5);
    }

    #[tokio::test]
    async fn load_unreadable_is_noop() {
        let dir = setup_test_dir();
        let model = test_model();
        let missing = model.get(None, &dir.path().join("ghost"), true);
        missing.load().wait().await.unwrap();
        assert!(!missing.is_loaded());
        assert!(missing.children().is_empty());
    }

    #[test]
    fn pseudo_root_adopts_static_children() {
        let dir = setup_test_dir();
        let model = test_model();
        let pseudo = model.pseudo_root(&[dir.path().join("alpha"), dir.path().join("A.txt")]);

        assert!(pseudo.is_pseudo_root());
        assert!(pseudo.is_directory());
        assert!(pseudo.is_loaded());
        assert_eq!(pseudo.children().len(), 2);
        assert!(!pseudo.is_leaf());
        assert!(!pseudo.is_dir_leaf()); // alpha is a directory

        // Members know the pseudo-root as a parent, but it never counts as
        // the real one.
        let alpha = model.get_path(&dir.path().join("alpha"));
        assert!(alpha.parents().iter().any(|p| Arc::ptr_eq(p, &pseudo)));
        assert!(alpha.parent().is_none());
    }

    #[test]
    fn empty_pseudo_root_is_leaf() {
        let model = test_model();
        let pseudo = model.pseudo_root(&[]);
        assert!(!pseudo.is_directory());
        assert!(pseudo.is_leaf());
        assert!(pseudo.is_dir_leaf());
    }

    #[test]
    fn search_mode_buffers_view_mutations() {
        let dir = setup_test_dir();
        let model = test_model();
        let alpha = model.get_path(&dir.path().join("alpha"));
        alpha.begin_search();

        let inner = alpha
            .adopt_created(&dir.path().join("alpha").join("inner.txt"), false)
            .unwrap();
        // Authoritative sequence has it; the observer view does not yet.
        assert!(alpha.children().is_empty());
        assert_eq!(alpha.children_snapshot().len(), 1);

        alpha.end_search();
        assert_eq!(alpha.children().len(), 1);
        assert!(Arc::ptr_eq(&alpha.children()[0], &inner));
    }

    #[test]
    fn display_order_comparators() {
        let dir = setup_test_dir();
        let model = test_model();
        let d = model.get_path(&dir.path().join("alpha"));
        let f1 = model.get_path(&dir.path().join("A.txt"));
        let f2 = model.get_path(&dir.path().join("b.txt"));

        assert_eq!(cmp_display(&d, &f1), CmpOrdering::Less);
        assert_eq!(cmp_display(&f1, &f2), CmpOrdering::Less);
        assert_eq!(cmp_by_size(&d, &f2), CmpOrdering::Less);

        fs::write(dir.path().join("A.txt"), "bigger content").unwrap();
        f1.refresh_attributes();
        assert_eq!(cmp_by_size(&f1, &f2), CmpOrdering::Less); // largest first
    }
}
