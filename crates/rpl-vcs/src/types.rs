use std::path::Path;

use anyhow::Result;
use sha2::{Digest, Sha256};

pub type CommitId = String;

/// One blob under a hashed path, as listed by the source tree at a commit.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TreeEntry {
    pub path: String,
    pub mode: String,
    pub blob: String,
}

/// Read-only view of the source repository a release is cut from.
pub trait SourceControl: Send + Sync {
    fn head_commit(&self, repo_root: &Path) -> Result<CommitId>;

    /// No staged, unstaged or untracked changes.
    fn is_clean(&self, repo_root: &Path) -> Result<bool>;

    /// Expand an abbreviated commit to the full id.
    fn resolve_commit(&self, repo_root: &Path, short: &str) -> Result<CommitId>;

    /// Blobs under `path` at `commit`, recursively.
    fn tree_at(&self, repo_root: &Path, commit: &str, path: &str) -> Result<Vec<TreeEntry>>;

    /// Content hash of the critical source path at `commit`.
    fn hash_path_at(&self, repo_root: &Path, commit: &str, path: &str) -> Result<String> {
        Ok(source_hash(&self.tree_at(repo_root, commit, path)?))
    }
}

/// sha256 over `mode blob path\n` lines sorted by path. Only committed
/// content participates, so the hash is reproducible from the commit alone.
pub fn source_hash(entries: &[TreeEntry]) -> String {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    let mut hasher = Sha256::new();
    for e in sorted {
        hasher.update(format!("{} {} {}\n", e.mode, e.blob, e.path).as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, blob: &str) -> TreeEntry {
        TreeEntry { path: path.into(), mode: "100644".into(), blob: blob.into() }
    }

    #[test]
    fn hash_ignores_listing_order() {
        let a = vec![entry("backend/a.rs", "1"), entry("backend/b.rs", "2")];
        let b = vec![entry("backend/b.rs", "2"), entry("backend/a.rs", "1")];
        assert_eq!(source_hash(&a), source_hash(&b));
    }

    #[test]
    fn hash_tracks_content_and_paths() {
        let base = source_hash(&[entry("backend/a.rs", "1")]);
        assert_ne!(base, source_hash(&[entry("backend/a.rs", "9")]));
        assert_ne!(base, source_hash(&[entry("backend/z.rs", "1")]));
        assert_eq!(base.len(), 64);
    }
}
