//! Parallel, depth-first, cancellable subtree search.
//!
//! Traversal fans out one task per child directory, bounded by the same
//! permit pool that gates directory listings, so search pressure and load
//! pressure never exceed the pool width combined. File names are matched
//! against a glob;
//! optionally file contents are scanned with a compiled text pattern and
//! matching line locations are reported.
//!
//! Matches stream through the caller's callback from worker tasks in no
//! particular order. The cancellation flag is checked when a subtree is
//! entered and again after a scan permit is acquired, so at most one file
//! scan completes after the flag is observed.
//!
//! Directories traversed purely for search keep their loaded state
//! untouched; listings performed on demand stay in the node for later
//! adoption.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use globset::GlobMatcher;
use regex::{Regex, RegexBuilder};
use tokio::task::JoinSet;

use crate::config::should_ignore;
use crate::error::{Error, Result};
use crate::loader::Completion;
use crate::model::ModelCtx;
use crate::node::PathNode;

/// Content pattern: a literal or a regular expression, optionally
/// case-insensitive.
#[derive(Debug, Clone)]
pub struct TextPattern {
    pattern: String,
    regex: bool,
    case_insensitive: bool,
}

impl TextPattern {
    pub fn literal(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            regex: false,
            case_insensitive: false,
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            regex: true,
            case_insensitive: false,
        }
    }

    pub fn case_insensitive(mut self, yes: bool) -> Self {
        self.case_insensitive = yes;
        self
    }

    fn compile(&self) -> Result<Regex> {
        let source = if self.regex {
            self.pattern.clone()
        } else {
            regex::escape(&self.pattern)
        };
        RegexBuilder::new(&source)
            .case_insensitive(self.case_insensitive)
            .build()
            .map_err(|e| Error::Pattern(e.to_string()))
    }
}

/// What to look for: a file-name glob plus an optional content pattern.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    name_glob: String,
    text: Option<TextPattern>,
}

impl SearchQuery {
    /// Match files whose name matches `glob` (e.g. `*.rs`).
    pub fn named(glob: impl Into<String>) -> Self {
        Self {
            name_glob: glob.into(),
            text: None,
        }
    }

    /// Additionally require file content to match `pattern`.
    pub fn with_text(mut self, pattern: TextPattern) -> Self {
        self.text = Some(pattern);
        self
    }
}

/// Location of one matching line within a file, 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMatch {
    pub line: usize,
    pub column: usize,
    pub text: String,
}

/// One search hit. `lines` is empty for name-only queries.
#[derive(Clone)]
pub struct SearchMatch {
    pub node: Arc<PathNode>,
    pub lines: Vec<LineMatch>,
}

pub(crate) type MatchFn = Arc<dyn Fn(SearchMatch) + Send + Sync>;

struct Shared {
    ctx: Arc<ModelCtx>,
    matcher: GlobMatcher,
    text: Option<Regex>,
    ignore: Vec<String>,
    on_match: MatchFn,
    cancel: Arc<AtomicBool>,
}

impl Shared {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

pub(crate) fn spawn(
    ctx: &Arc<ModelCtx>,
    root: Arc<PathNode>,
    query: SearchQuery,
    on_match: MatchFn,
    cancel: Arc<AtomicBool>,
) -> Completion {
    let matcher = match globset::Glob::new(&query.name_glob) {
        Ok(glob) => glob.compile_matcher(),
        Err(e) => return Completion::ready(Err(Error::Pattern(e.to_string()))),
    };
    let text = match &query.text {
        Some(pattern) => match pattern.compile() {
            Ok(regex) => Some(regex),
            Err(e) => return Completion::ready(Err(e)),
        },
        None => None,
    };

    let shared = Arc::new(Shared {
        ctx: Arc::clone(ctx),
        matcher,
        text,
        ignore: ctx.config.ignore_patterns(),
        on_match,
        cancel,
    });

    let (tx, completion) = Completion::channel();
    tokio::spawn(async move {
        let outcome = visit(shared, root).await;
        let _ = tx.send(outcome);
    });
    completion
}

fn visit(
    shared: Arc<Shared>,
    node: Arc<PathNode>,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        if shared.cancelled() {
            return Ok(());
        }
        if !node.is_pseudo_root() && should_ignore(&node.path(), &shared.ignore) {
            return Ok(());
        }
        // A childless pseudo-root also reports !is_directory; it is never a
        // scannable file.
        if !node.is_pseudo_root() && node.is_file() {
            return scan_file(&shared, node).await;
        }
        if !node.is_pseudo_root() && !node.is_readable() {
            return Ok(());
        }

        node.begin_search();

        let children = if node.is_pseudo_root() {
            node.children_snapshot()
        } else {
            match list_children(&shared, &node).await {
                Ok(children) => children,
                Err(e) => {
                    tracing::warn!(path = %node.path().display(), error = %e, "search listing failed");
                    node.end_search();
                    return Ok(());
                }
            }
        };

        let mut tasks = JoinSet::new();
        for child in children {
            if shared.cancelled() {
                break;
            }
            tasks.spawn(visit(Arc::clone(&shared), child));
        }

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                }
                Err(e) => {
                    if outcome.is_ok() {
                        outcome = Err(Error::Task(e.to_string()));
                    }
                }
            }
        }

        node.end_search();
        outcome
    })
}

/// List a directory's children for traversal, bounded by a pool permit. The
/// permit is held for the listing only, never across child descents.
async fn list_children(shared: &Arc<Shared>, node: &Arc<PathNode>) -> Result<Vec<Arc<PathNode>>> {
    if !node.children_snapshot().is_empty() || node.is_loaded() {
        return Ok(node.children_snapshot());
    }
    let permit = shared.ctx.loader.acquire().await?;
    if shared.cancelled() {
        return Ok(Vec::new());
    }
    let target = Arc::clone(node);
    let listed = tokio::task::spawn_blocking(move || target.list_for_search())
        .await
        .map_err(|e| Error::Task(e.to_string()))?;
    drop(permit);
    listed
}

async fn scan_file(shared: &Arc<Shared>, node: Arc<PathNode>) -> Result<()> {
    if shared.cancelled() {
        return Ok(());
    }
    let name = node.name();
    if !shared.matcher.is_match(Path::new(&name)) {
        return Ok(());
    }

    let Some(regex) = shared.text.clone() else {
        (shared.on_match)(SearchMatch {
            node,
            lines: Vec::new(),
        });
        return Ok(());
    };

    let permit = shared.ctx.loader.acquire().await?;
    // Re-check after the (possibly long) permit wait.
    if shared.cancelled() {
        return Ok(());
    }
    let path = node.path();
    let lines = tokio::task::spawn_blocking(move || scan_content(&path, &regex))
        .await
        .map_err(|e| Error::Task(e.to_string()))?;
    drop(permit);

    if !lines.is_empty() {
        (shared.on_match)(SearchMatch { node, lines });
    }
    Ok(())
}

/// Scan a file's content, reporting the first match per line. Unreadable or
/// non-UTF-8 files are skipped.
fn scan_content(path: &Path, regex: &Regex) -> Vec<LineMatch> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::trace!(path = %path.display(), error = %e, "skipping unscannable file");
            return Vec::new();
        }
    };
    content
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            regex.find(line).map(|m| LineMatch {
                line: index + 1,
                column: m.start() + 1,
                text: line.to_string(),
            })
        })
        .collect()
}
