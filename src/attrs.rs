use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Immutable snapshot of OS metadata for one path, captured on demand.
///
/// A snapshot never changes after capture; re-snapshotting produces a new
/// value. Comparing the `modified` timestamps of two snapshots is how the
/// watch bridge filters out spurious modify notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathAttributes {
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub readable: bool,
    pub directory: bool,
    pub hidden: bool,
}

impl PathAttributes {
    /// Capture a snapshot for `path`. Missing or unreadable paths yield a
    /// zeroed, unreadable snapshot rather than an error.
    pub fn snapshot(path: &Path) -> Self {
        let hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(false);

        match fs::symlink_metadata(path) {
            Ok(metadata) => {
                let directory = metadata.is_dir();
                Self {
                    size: metadata.len(),
                    modified: metadata.modified().ok(),
                    readable: is_readable(path, directory),
                    directory,
                    hidden,
                }
            }
            Err(_) => Self {
                size: 0,
                modified: None,
                readable: false,
                directory: false,
                hidden,
            },
        }
    }
}

/// Probe whether `path` can actually be read, not merely stat'ed.
///
/// Directories are probed by opening the directory stream, files by opening
/// the file.
pub fn is_readable(path: &Path, directory: bool) -> bool {
    if directory {
        fs::read_dir(path).is_ok()
    } else {
        fs::File::open(path).is_ok()
    }
}
