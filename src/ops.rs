//! Filesystem operations that keep the node tree synchronized.
//!
//! Each operation performs the disk change first and, on success, applies
//! the matching tree mutation, so watch events arriving later for the same
//! change are absorbed by the idempotence checks in event application.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::node::PathNode;

/// Create an empty file named `name` under `parent` and adopt it.
pub fn create_file(parent: &Arc<PathNode>, name: &str) -> Result<Arc<PathNode>> {
    let path = parent.path().join(name);
    fs::File::create(&path)?;
    parent.adopt_created(&path, false)
}

/// Create a directory named `name` under `parent` and adopt it.
pub fn create_dir(parent: &Arc<PathNode>, name: &str) -> Result<Arc<PathNode>> {
    let path = parent.path().join(name);
    fs::create_dir(&path)?;
    parent.adopt_created(&path, true)
}

/// Rename `node` in place to `new_name`, rewriting descendant paths.
pub fn rename(node: &Arc<PathNode>, new_name: &str) -> Result<()> {
    let old_path = node.path();
    let parent_dir = old_path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no parent directory"))?;
    let new_path = parent_dir.join(new_name);
    fs::rename(&old_path, &new_path)?;
    node.rename_to(&new_path, new_name)
}

/// Delete `node` from disk and from the tree. Directories are removed
/// recursively.
///
/// Veto predicates are not consulted here; callers that honor them check
/// [`PathNode::not_to_be_deleted`] first.
pub fn delete(node: &Arc<PathNode>) -> Result<()> {
    let path = node.path();
    if node.is_directory() {
        fs::remove_dir_all(&path)?;
    } else {
        fs::remove_file(&path)?;
    }
    node.delete()
}

/// Resolve a name collision by appending `_copy`, `_copy2`, etc.
///
/// Returns a path that does not exist yet in the destination directory.
pub fn resolve_collision(dest: &Path) -> PathBuf {
    if !dest.exists() {
        return dest.to_path_buf();
    }

    let parent = dest.parent().unwrap_or(Path::new("."));
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = dest.extension().map(|e| e.to_string_lossy().to_string());

    for i in 1..=1000 {
        let suffix = if i == 1 {
            "_copy".to_string()
        } else {
            format!("_copy{}", i)
        };
        let new_name = match &ext {
            Some(e) => format!("{}{}.{}", stem, suffix, e),
            None => format!("{}{}", stem, suffix),
        };
        let candidate = parent.join(&new_name);
        if !candidate.exists() {
            return candidate;
        }
    }

    // Fallback: should not happen in practice
    dest.to_path_buf()
}

/// Copy `node` into `dest_parent`, resolving name collisions, and adopt the
/// copy as a new node. The source is untouched.
pub fn copy(node: &Arc<PathNode>, dest_parent: &Arc<PathNode>) -> Result<Arc<PathNode>> {
    let src = node.path();
    let name = src
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no filename"))?;
    let dest = resolve_collision(&dest_parent.path().join(name));

    if node.is_directory() {
        copy_dir_recursive(&src, &dest)?;
    } else {
        fs::copy(&src, &dest)?;
    }
    dest_parent.adopt_created(&dest, node.is_directory())
}

/// Internal recursive directory copy.
fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dest_path = dest.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dest_path)?;
        } else {
            fs::copy(&src_path, &dest_path)?;
        }
    }
    Ok(())
}

/// Move `node` into `dest_parent`, resolving name collisions.
///
/// Uses `fs::rename` first (fast, same-device) and falls back to
/// copy+delete for cross-device moves. The node keeps its identity and is
/// reattached under `dest_parent`. Returns the final path.
pub fn move_item(node: &Arc<PathNode>, dest_parent: &Arc<PathNode>) -> Result<PathBuf> {
    let src = node.path();
    let name = src
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no filename"))?;
    let dest = resolve_collision(&dest_parent.path().join(name));

    match fs::rename(&src, &dest) {
        Ok(()) => {}
        Err(_) => {
            // Cross-device fallback
            if node.is_directory() {
                copy_dir_recursive(&src, &dest)?;
                fs::remove_dir_all(&src)?;
            } else {
                fs::copy(&src, &dest)?;
                fs::remove_file(&src)?;
            }
        }
    }
    node.move_to(dest_parent, &dest)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::error::Error;
    use crate::model::PathModel;
    use tempfile::TempDir;

    fn test_model() -> PathModel {
        let cfg: ModelConfig = toml::from_str("[watcher]\nenabled = false").unwrap();
        PathModel::new(cfg)
    }

    #[test]
    fn create_file_adopts_child() {
        let tmp = TempDir::new().unwrap();
        let model = test_model();
        let parent = model.get_path(tmp.path());

        let file = create_file(&parent, "test.txt").unwrap();
        assert!(tmp.path().join("test.txt").exists());
        assert_eq!(file.name(), "test.txt");
        assert!(parent.children().iter().any(|c| Arc::ptr_eq(c, &file)));
        assert!(Arc::ptr_eq(&file.parent().unwrap(), &parent));
    }

    #[test]
    fn create_dir_adopts_child() {
        let tmp = TempDir::new().unwrap();
        let model = test_model();
        let parent = model.get_path(tmp.path());

        let dir = create_dir(&parent, "subdir").unwrap();
        assert!(tmp.path().join("subdir").is_dir());
        assert!(dir.is_directory());
        assert!(!parent.is_dir_leaf());
    }

    #[test]
    fn create_dir_already_exists_fails() {
        let tmp = TempDir::new().unwrap();
        let model = test_model();
        let parent = model.get_path(tmp.path());
        create_dir(&parent, "dup").unwrap();
        assert!(matches!(create_dir(&parent, "dup"), Err(Error::Io(_))));
        assert_eq!(parent.children().len(), 1);
    }

    #[tokio::test]
    async fn rename_updates_disk_and_tree() {
        let tmp = TempDir::new().unwrap();
        let model = test_model();
        let dir = create_dir(&model.get_path(tmp.path()), "old_name").unwrap();
        create_file(&dir, "inner.txt").unwrap();
        let inner = model.get_path(&tmp.path().join("old_name").join("inner.txt"));

        rename(&dir, "new_name").unwrap();
        assert!(!tmp.path().join("old_name").exists());
        assert!(tmp.path().join("new_name").is_dir());
        assert_eq!(dir.name(), "new_name");
        assert_eq!(inner.path(), tmp.path().join("new_name").join("inner.txt"));
    }

    #[test]
    fn rename_nonexistent_fails() {
        let tmp = TempDir::new().unwrap();
        let model = test_model();
        let ghost = model.get(None, &tmp.path().join("no_such_file.txt"), false);
        assert!(rename(&ghost, "dest.txt").is_err());
    }

    #[test]
    fn delete_file_removes_disk_and_node() {
        let tmp = TempDir::new().unwrap();
        let model = test_model();
        let parent = model.get_path(tmp.path());
        let file = create_file(&parent, "delete_me.txt").unwrap();

        delete(&file).unwrap();
        assert!(!tmp.path().join("delete_me.txt").exists());
        assert!(file.is_deleted());
        assert!(parent.children().is_empty());
    }

    #[test]
    fn delete_directory_recursively() {
        let tmp = TempDir::new().unwrap();
        let model = test_model();
        let parent = model.get_path(tmp.path());
        let dir = create_dir(&parent, "victim").unwrap();
        create_file(&dir, "a.txt").unwrap();
        let sub = create_dir(&dir, "child").unwrap();
        create_file(&sub, "b.txt").unwrap();

        delete(&dir).unwrap();
        assert!(!tmp.path().join("victim").exists());
        assert!(dir.is_deleted());
        assert!(sub.is_deleted());
    }

    #[test]
    fn delete_nonexistent_fails() {
        let tmp = TempDir::new().unwrap();
        let model = test_model();
        let ghost = model.get(None, &tmp.path().join("no_such_file.txt"), false);
        assert!(delete(&ghost).is_err());
        assert!(!ghost.is_deleted());
    }

    #[test]
    fn copy_file_to_new_dest() {
        let tmp = TempDir::new().unwrap();
        let model = test_model();
        let root = model.get_path(tmp.path());
        let src = create_file(&root, "src.txt").unwrap();
        fs::write(src.path(), "hello").unwrap();
        let dest = create_dir(&root, "dest").unwrap();

        let copied = copy(&src, &dest).unwrap();
        assert_eq!(copied.path(), tmp.path().join("dest").join("src.txt"));
        assert_eq!(fs::read_to_string(copied.path()).unwrap(), "hello");
        assert!(src.path().exists());
        // Distinct identity from the source.
        assert!(!Arc::ptr_eq(&copied, &src));
    }

    #[test]
    fn copy_collision_appends_suffix() {
        let tmp = TempDir::new().unwrap();
        let model = test_model();
        let root = model.get_path(tmp.path());
        let src = create_file(&root, "file.txt").unwrap();

        // file.txt already exists at dest
        let copied = copy(&src, &root).unwrap();
        assert_eq!(copied.path(), tmp.path().join("file_copy.txt"));

        let again = copy(&src, &root).unwrap();
        assert_eq!(again.path(), tmp.path().join("file_copy2.txt"));
    }

    #[test]
    fn copy_directory_recursive() {
        let tmp = TempDir::new().unwrap();
        let model = test_model();
        let root = model.get_path(tmp.path());
        let src_dir = create_dir(&root, "src_dir").unwrap();
        fs::write(src_dir.path().join("a.txt"), "aaa").unwrap();
        fs::create_dir(src_dir.path().join("sub")).unwrap();
        fs::write(src_dir.path().join("sub").join("b.txt"), "bbb").unwrap();
        let dest = create_dir(&root, "dest").unwrap();

        let copied = copy(&src_dir, &dest).unwrap();
        assert!(copied.path().join("a.txt").exists());
        assert_eq!(
            fs::read_to_string(copied.path().join("sub").join("b.txt")).unwrap(),
            "bbb"
        );
    }

    #[test]
    fn move_file_keeps_identity() {
        let tmp = TempDir::new().unwrap();
        let model = test_model();
        let root = model.get_path(tmp.path());
        let src = create_file(&root, "move_me.txt").unwrap();
        fs::write(src.path(), "content").unwrap();
        let dest = create_dir(&root, "dest").unwrap();

        let final_path = move_item(&src, &dest).unwrap();
        assert_eq!(final_path, tmp.path().join("dest").join("move_me.txt"));
        assert!(!tmp.path().join("move_me.txt").exists());
        assert_eq!(fs::read_to_string(&final_path).unwrap(), "content");

        assert_eq!(src.path(), final_path);
        assert!(Arc::ptr_eq(&src.parent().unwrap(), &dest));
        assert!(Arc::ptr_eq(&model.get_path(&final_path), &src));
    }

    #[test]
    fn move_with_collision() {
        let tmp = TempDir::new().unwrap();
        let model = test_model();
        let root = model.get_path(tmp.path());
        let src = create_file(&root, "file.txt").unwrap();
        fs::write(src.path(), "new").unwrap();
        let dest = create_dir(&root, "dest").unwrap();
        fs::write(dest.path().join("file.txt"), "existing").unwrap();

        let final_path = move_item(&src, &dest).unwrap();
        assert_eq!(final_path, dest.path().join("file_copy.txt"));
        // Original at dest untouched
        assert_eq!(
            fs::read_to_string(dest.path().join("file.txt")).unwrap(),
            "existing"
        );
    }

    #[test]
    fn resolve_collision_no_conflict() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("new.txt");
        assert_eq!(resolve_collision(&path), path);
    }

    #[test]
    fn resolve_collision_no_extension() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("Makefile");
        fs::write(&path, "").unwrap();
        assert_eq!(resolve_collision(&path), tmp.path().join("Makefile_copy"));
    }
}
