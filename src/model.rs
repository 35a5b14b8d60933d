//! Process-wide entry point of the path model.
//!
//! A [`PathModel`] owns the weak-lifetime node cache, the tree coordination
//! lock that serializes directory listing against watch-event application,
//! the background worker pool, the optional watch bridge, and the global
//! deletion listener registry.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::cache::PathCache;
use crate::config::ModelConfig;
use crate::loader::{BackgroundLoader, Completion};
use crate::node::PathNode;
use crate::search::{self, SearchMatch, SearchQuery};
use crate::watch::WatchBridge;

pub(crate) type DeletedAnywhereFn = dyn Fn(&Arc<PathNode>) + Send + Sync;

/// Shared state behind every node of one model instance.
pub(crate) struct ModelCtx {
    pub(crate) cache: PathCache,
    /// Serializes directory listing and watch-event application: the two
    /// must never interleave for the same subtree.
    pub(crate) tree_lock: Mutex<()>,
    pub(crate) loader: BackgroundLoader,
    pub(crate) watch: Mutex<Option<Arc<WatchBridge>>>,
    pub(crate) deleted_anywhere: Mutex<Vec<(u64, Weak<DeletedAnywhereFn>)>>,
    pub(crate) next_id: AtomicU64,
    pub(crate) config: ModelConfig,
}

impl ModelCtx {
    pub(crate) fn next_callback_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn watch_bridge(&self) -> Option<Arc<WatchBridge>> {
        self.watch.lock().unwrap().clone()
    }

    /// Fire every live global deletion listener for `node`, pruning dead
    /// subscriptions along the way.
    pub(crate) fn notify_deleted_anywhere(&self, node: &Arc<PathNode>) {
        let live: Vec<Arc<DeletedAnywhereFn>> = {
            let mut listeners = self.deleted_anywhere.lock().unwrap();
            listeners.retain(|(_, weak)| weak.strong_count() > 0);
            listeners
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for listener in live {
            listener(node);
        }
    }
}

/// RAII handle for a global deletion subscription.
///
/// The registry holds the callback weakly; dropping the subscription
/// releases it. There is no implicit garbage collection of listeners.
pub struct Subscription {
    callback: Option<Arc<DeletedAnywhereFn>>,
    id: u64,
    ctx: Weak<ModelCtx>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.callback.take();
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.deleted_anywhere
                .lock()
                .unwrap()
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// The deduplicated, lazily-loaded filesystem path model.
pub struct PathModel {
    ctx: Arc<ModelCtx>,
}

impl PathModel {
    /// Build a model from an explicit configuration.
    pub fn new(config: ModelConfig) -> Self {
        let max_parallel = config.max_parallel();
        let watcher_enabled = config.watcher_enabled();
        let ignore = config.ignore_patterns();

        let ctx = Arc::new(ModelCtx {
            cache: PathCache::new(),
            tree_lock: Mutex::new(()),
            loader: BackgroundLoader::new(max_parallel),
            watch: Mutex::new(None),
            deleted_anywhere: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            config,
        });

        if watcher_enabled {
            match WatchBridge::new(Arc::downgrade(&ctx), ignore) {
                Ok(bridge) => *ctx.watch.lock().unwrap() = Some(Arc::new(bridge)),
                Err(e) => {
                    tracing::warn!(error = %e, "filesystem watcher unavailable, running unwatched")
                }
            }
        }

        Self { ctx }
    }

    /// Build a model from configuration files and defaults.
    pub fn with_defaults() -> Self {
        Self::new(ModelConfig::load(None))
    }

    /// Return the node for `path`, constructing one if no live node exists.
    ///
    /// `is_dir` is a hint that spares a filesystem probe when the caller
    /// already knows the entry kind.
    pub fn get(
        &self,
        parent: Option<&Arc<PathNode>>,
        path: &Path,
        is_dir: bool,
    ) -> Arc<PathNode> {
        let node = self.ctx.cache.get(&self.ctx, parent, path, is_dir);
        node.resubscribe_watch();
        node
    }

    /// Return the node for `path`, probing the filesystem for its kind.
    pub fn get_path(&self, path: &Path) -> Arc<PathNode> {
        self.get(None, path, path.is_dir())
    }

    /// Look up a live node without constructing one.
    pub fn cached(&self, path: &Path) -> Option<Arc<PathNode>> {
        self.ctx.cache.lookup(path)
    }

    /// The filesystem root node.
    ///
    /// A fresh handle is produced per call so the root is reclaimable like
    /// any other node once all handles are dropped.
    pub fn root(&self) -> Arc<PathNode> {
        let root = PathBuf::from(std::path::MAIN_SEPARATOR.to_string());
        self.get(None, &root, true)
    }

    /// Build a synthetic root aggregating an arbitrary set of paths.
    ///
    /// The pseudo-root is not cached and not backed by a real directory;
    /// its children are pre-supplied and adopted synchronously by `load`.
    pub fn pseudo_root(&self, paths: &[PathBuf]) -> Arc<PathNode> {
        let pseudo = PathNode::new_pseudo(&self.ctx);
        let children: Vec<Arc<PathNode>> = paths
            .iter()
            .map(|p| self.ctx.cache.get(&self.ctx, Some(&pseudo), p, p.is_dir()))
            .collect();
        for child in &children {
            child.resubscribe_watch();
        }
        pseudo.adopt_static(children);
        pseudo
    }

    /// Register a process-wide listener fired on every node deletion,
    /// owner-initiated or external.
    ///
    /// The listener lives as long as the returned [`Subscription`].
    pub fn on_deleted_anywhere<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Arc<PathNode>) + Send + Sync + 'static,
    {
        let callback: Arc<DeletedAnywhereFn> = Arc::new(f);
        let id = self.ctx.next_callback_id();
        self.ctx
            .deleted_anywhere
            .lock()
            .unwrap()
            .push((id, Arc::downgrade(&callback)));
        Subscription {
            callback: Some(callback),
            id,
            ctx: Arc::downgrade(&self.ctx),
        }
    }

    /// Search the subtree under `root` (a real directory node or a
    /// pseudo-root) for files whose name matches the query glob, optionally
    /// constrained to files whose content matches the text pattern.
    ///
    /// Matches stream through `on_match` from worker threads in no
    /// particular order. `cancel` is observed cooperatively per subtree and
    /// per file. The returned completion resolves when traversal stops.
    pub fn search<F>(
        &self,
        root: &Arc<PathNode>,
        query: SearchQuery,
        on_match: F,
        cancel: Arc<AtomicBool>,
    ) -> Completion
    where
        F: Fn(SearchMatch) + Send + Sync + 'static,
    {
        search::spawn(&self.ctx, root.clone(), query, Arc::new(on_match), cancel)
    }

    /// The shared background execution surface.
    pub fn background(&self) -> &BackgroundLoader {
        &self.ctx.loader
    }

    /// The effective configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.ctx.config
    }

    /// Number of live cache entries, mostly useful for diagnostics.
    pub fn cached_nodes(&self) -> usize {
        self.ctx.cache.live_len()
    }

    /// Drop cache slots whose nodes have been reclaimed.
    pub fn purge_cache(&self) -> usize {
        self.ctx.cache.purge()
    }

    pub(crate) fn ctx(&self) -> &Arc<ModelCtx> {
        &self.ctx
    }
}
