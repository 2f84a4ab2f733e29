//! Deterministic source tree traversal
//!
//! The walk visits entries in sorted order with parents before
//! children, which gives the stream its directory-before-content
//! guarantee and makes repeated runs over an unchanged tree produce
//! identical entry sequences.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One entry yielded by the walk, keyed by its path relative to the
/// backup root
#[derive(Debug)]
pub struct WalkEntry {
    pub abs: PathBuf,
    pub rel: String,
    pub meta: std::fs::Metadata,
}

/// Walk the tree under `root` in sorted order. The root itself is not
/// yielded; paths come out relative with `/` separators.
pub fn walk_tree(
    root: &Path,
    follow_links: bool,
) -> impl Iterator<Item = Result<WalkEntry>> + '_ {
    WalkDir::new(root)
        .follow_links(follow_links)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |item| match item {
            Ok(entry) => {
                if entry.depth() == 0 {
                    return None;
                }
                Some(build_entry(root, entry))
            }
            Err(e) => Some(Err(Error::storage(format!("walking source tree: {}", e)))),
        })
}

fn build_entry(root: &Path, entry: walkdir::DirEntry) -> Result<WalkEntry> {
    let abs = entry.path().to_path_buf();
    let rel = relative_path(root, &abs)?;
    let meta = entry
        .metadata()
        .map_err(|e| Error::storage(format!("stat {}: {}", abs.display(), e)))?;
    Ok(WalkEntry { abs, rel, meta })
}

fn relative_path(root: &Path, abs: &Path) -> Result<String> {
    let rel = abs
        .strip_prefix(root)
        .map_err(|_| Error::storage(format!("path {} escapes walk root", abs.display())))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_sorted_parents_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/x"), b"x").unwrap();
        std::fs::write(dir.path().join("b"), b"b").unwrap();
        std::fs::write(dir.path().join("a"), b"a").unwrap();

        let rels: Vec<String> = walk_tree(dir.path(), false)
            .map(|e| e.unwrap().rel)
            .collect();
        assert_eq!(rels, vec!["a", "b", "sub", "sub/x"]);
    }

    #[test]
    fn test_symlink_not_followed_by_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("target"), b"data").unwrap();
        std::os::unix::fs::symlink("target", dir.path().join("link")).unwrap();

        let entries: Vec<WalkEntry> = walk_tree(dir.path(), false)
            .map(|e| e.unwrap())
            .collect();
        let link = entries.iter().find(|e| e.rel == "link").unwrap();
        assert!(link.meta.file_type().is_symlink());
    }

    #[test]
    fn test_dereference_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("target"), b"data").unwrap();
        std::os::unix::fs::symlink("target", dir.path().join("link")).unwrap();

        let entries: Vec<WalkEntry> = walk_tree(dir.path(), true)
            .map(|e| e.unwrap())
            .collect();
        let link = entries.iter().find(|e| e.rel == "link").unwrap();
        assert!(link.meta.file_type().is_file());
    }
}
