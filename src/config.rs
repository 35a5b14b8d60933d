//! Model configuration: TOML file loading, programmatic overrides, defaults.
//!
//! Resolution order (first found wins, values merge/override):
//! 1. Programmatic overrides passed to [`ModelConfig::load`]
//! 2. `$PATH_MODEL_CONFIG` environment variable (path to config file)
//! 3. Project-local `.path-model.toml` in the current working directory
//! 4. Global `~/.config/path-model/config.toml`
//! 5. Built-in defaults

use std::path::{Path, PathBuf};

use serde::Deserialize;

// ── Section configs ──────────────────────────────────────────────────────────

/// Background worker pool settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoaderConfig {
    /// Maximum number of directory listings / file scans running in parallel.
    pub max_parallel: Option<usize>,
}

/// Filesystem watcher settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WatcherConfig {
    /// Enable per-directory change notification.
    pub enabled: Option<bool>,
}

/// Traversal ignore settings, applied to watch dispatch and search descent.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct IgnoreConfig {
    /// Path components that are skipped entirely.
    pub patterns: Option<Vec<String>>,
}

// ── Top-level config ─────────────────────────────────────────────────────────

/// Top-level model configuration.
///
/// All fields are optional so that partial configs from different sources
/// can be merged together (overrides win over files, files over defaults).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ModelConfig {
    pub loader: LoaderConfig,
    pub watcher: WatcherConfig,
    pub ignore: IgnoreConfig,
}

// ── Default constants ────────────────────────────────────────────────────────

/// Default ignore patterns for watch dispatch and search traversal.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    "venv",
    ".venv",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    "target",
];

/// Fallback pool width when available parallelism cannot be determined.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

// ── Config file locator ──────────────────────────────────────────────────────

/// Return the list of candidate config file paths in priority order.
fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. $PATH_MODEL_CONFIG environment variable
    if let Ok(env_path) = std::env::var("PATH_MODEL_CONFIG") {
        paths.push(PathBuf::from(env_path));
    }

    // 2. Project-local `.path-model.toml` in CWD
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".path-model.toml"));
    }

    // 3. Global `~/.config/path-model/config.toml`
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("path-model").join("config.toml"));
    }

    paths
}

/// Try to read and parse a TOML config file. Returns `None` if the file
/// doesn't exist or can't be parsed.
fn load_file(path: &Path) -> Option<ModelConfig> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return None,
    };
    match toml::from_str::<ModelConfig>(&content) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse config file");
            None
        }
    }
}

// ── Merge logic ──────────────────────────────────────────────────────────────

impl ModelConfig {
    /// Merge `other` on top of `self` — `other`'s `Some` values win.
    pub fn merge(self, other: &ModelConfig) -> ModelConfig {
        ModelConfig {
            loader: LoaderConfig {
                max_parallel: other.loader.max_parallel.or(self.loader.max_parallel),
            },
            watcher: WatcherConfig {
                enabled: other.watcher.enabled.or(self.watcher.enabled),
            },
            ignore: IgnoreConfig {
                patterns: other.ignore.patterns.clone().or(self.ignore.patterns),
            },
        }
    }

    /// Load the final merged configuration.
    ///
    /// `overrides` are partial programmatic overrides with highest priority.
    pub fn load(overrides: Option<&ModelConfig>) -> ModelConfig {
        // Start with built-in defaults (all None — the struct Default).
        let mut config = ModelConfig::default();

        // Walk candidates in reverse so that highest-priority overwrites lower.
        let paths = candidate_paths();
        for path in paths.iter().rev() {
            if let Some(file_cfg) = load_file(path) {
                config = config.merge(&file_cfg);
            }
        }

        if let Some(overrides) = overrides {
            config = config.merge(overrides);
        }

        config
    }

    // ── Convenience getters with built-in defaults ──────────────────────────

    /// Maximum parallel background jobs.
    pub fn max_parallel(&self) -> usize {
        self.loader.max_parallel.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(DEFAULT_MAX_PARALLEL)
        })
    }

    /// Whether the watcher is enabled.
    pub fn watcher_enabled(&self) -> bool {
        self.watcher.enabled.unwrap_or(true)
    }

    /// Ignore patterns for watch dispatch and search traversal.
    pub fn ignore_patterns(&self) -> Vec<String> {
        self.ignore.patterns.clone().unwrap_or_else(|| {
            DEFAULT_IGNORE_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect()
        })
    }
}

/// Check if a path should be ignored based on ignore patterns.
///
/// A path is ignored if any of its components match any ignore pattern exactly.
pub fn should_ignore(path: &Path, patterns: &[String]) -> bool {
    for component in path.components() {
        if let std::path::Component::Normal(name) = component {
            let name_str = name.to_string_lossy();
            for pattern in patterns {
                if name_str == *pattern {
                    return true;
                }
            }
        }
    }
    false
}
