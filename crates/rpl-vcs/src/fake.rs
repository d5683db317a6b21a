use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::types::{CommitId, SourceControl, TreeEntry};

/// Scriptable source repository for pipeline tests.
#[derive(Default)]
pub struct FakeSource {
    inner: Mutex<FakeInner>,
}

#[derive(Default)]
struct FakeInner {
    head: CommitId,
    dirty: bool,
    trees: HashMap<CommitId, Vec<TreeEntry>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, FakeInner>> {
        self.inner.lock().map_err(|_| anyhow!("fake source lock poisoned"))
    }

    /// Record a commit with the given files (`path`, `content id`) and move HEAD to it.
    pub fn commit(&self, id: &str, files: &[(&str, &str)]) -> Result<()> {
        let mut inner = self.lock()?;
        let entries = files
            .iter()
            .map(|(path, blob)| TreeEntry {
                path: path.to_string(),
                mode: "100644".to_string(),
                blob: blob.to_string(),
            })
            .collect();
        inner.trees.insert(id.to_string(), entries);
        inner.head = id.to_string();
        Ok(())
    }

    pub fn set_dirty(&self, dirty: bool) -> Result<()> {
        self.lock()?.dirty = dirty;
        Ok(())
    }
}

impl SourceControl for FakeSource {
    fn head_commit(&self, _repo_root: &Path) -> Result<CommitId> {
        let inner = self.lock()?;
        if inner.head.is_empty() {
            return Err(anyhow!("repository has no commits"));
        }
        Ok(inner.head.clone())
    }

    fn is_clean(&self, _repo_root: &Path) -> Result<bool> {
        Ok(!self.lock()?.dirty)
    }

    fn resolve_commit(&self, _repo_root: &Path, short: &str) -> Result<CommitId> {
        let inner = self.lock()?;
        let mut matches = inner.trees.keys().filter(|id| id.starts_with(short));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id.clone()),
            (Some(_), Some(_)) => Err(anyhow!("ambiguous commit {short}")),
            (None, _) => Err(anyhow!("unknown commit {short}")),
        }
    }

    fn tree_at(&self, _repo_root: &Path, commit: &str, path: &str) -> Result<Vec<TreeEntry>> {
        let inner = self.lock()?;
        let tree = inner.trees.get(commit).ok_or_else(|| anyhow!("unknown commit {commit}"))?;
        let prefix = path.trim_end_matches('/');
        Ok(tree
            .iter()
            .filter(|e| prefix.is_empty() || e.path == prefix || e.path.starts_with(&format!("{prefix}/")))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_only_covers_the_requested_path() {
        let src = FakeSource::new();
        src.commit("aaaa1111", &[("backend/main.rs", "1"), ("docs/readme", "1")]).unwrap();
        let h1 = src.hash_path_at(Path::new("."), "aaaa1111", "backend").unwrap();
        src.commit("bbbb2222", &[("backend/main.rs", "1"), ("docs/readme", "2")]).unwrap();
        let h2 = src.hash_path_at(Path::new("."), "bbbb2222", "backend").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(src.head_commit(Path::new(".")).unwrap(), "bbbb2222");
        assert_eq!(src.resolve_commit(Path::new("."), "aaaa").unwrap(), "aaaa1111");
    }
}
