use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use rpl_vcs::{CommitId, SourceControl, TreeEntry};

/// `SourceControl` backed by the `git` binary.
#[derive(Clone, Debug, Default)]
pub struct GitSource {
    /// Repo-relative paths left out of the clean-tree check.
    ignored: Vec<String>,
}

impl GitSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave `path` out of `is_clean`, e.g. a tool's own state directory.
    pub fn ignoring(mut self, path: impl Into<String>) -> Self {
        self.ignored.push(path.into());
        self
    }

    fn run(repo: &Path, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(args[0]);
        cmd.args(&args[1..]).current_dir(repo);
        let out = cmd.output().with_context(|| format!("run {:?}", args))?;
        if !out.status.success() {
            return Err(anyhow!(
                "command failed: {:?}\nstdout:{}\nstderr:{}",
                args,
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

/// Parse `git ls-tree -r -z` output: `<mode> <type> <object>\t<path>\0`.
pub fn parse_ls_tree(raw: &str) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    for record in raw.split('\0').filter(|r| !r.trim().is_empty()) {
        let (meta, path) = record
            .split_once('\t')
            .ok_or_else(|| anyhow!("malformed ls-tree record: {record:?}"))?;
        let mut fields = meta.split_whitespace();
        let (Some(mode), Some(_kind), Some(blob)) = (fields.next(), fields.next(), fields.next()) else {
            return Err(anyhow!("malformed ls-tree record: {record:?}"));
        };
        entries.push(TreeEntry {
            path: path.to_string(),
            mode: mode.to_string(),
            blob: blob.to_string(),
        });
    }
    Ok(entries)
}

impl SourceControl for GitSource {
    fn head_commit(&self, repo_root: &Path) -> Result<CommitId> {
        Self::run(repo_root, &["git", "rev-parse", "HEAD"])
    }

    fn is_clean(&self, repo_root: &Path) -> Result<bool> {
        let excludes: Vec<String> = self.ignored.iter().map(|p| format!(":(exclude){p}")).collect();
        let mut args = vec!["git", "status", "--porcelain", "--", "."];
        args.extend(excludes.iter().map(|s| s.as_str()));
        let out = Self::run(repo_root, &args)?;
        Ok(out.is_empty())
    }

    fn resolve_commit(&self, repo_root: &Path, short: &str) -> Result<CommitId> {
        let spec = format!("{short}^{{commit}}");
        Self::run(repo_root, &["git", "rev-parse", "--verify", "--quiet", &spec])
            .with_context(|| format!("resolve commit {short}"))
    }

    fn tree_at(&self, repo_root: &Path, commit: &str, path: &str) -> Result<Vec<TreeEntry>> {
        let raw = Self::run(repo_root, &["git", "ls-tree", "-r", "-z", "--full-tree", commit, "--", path])?;
        let entries = parse_ls_tree(&raw)?;
        tracing::debug!(commit, path, entries = entries.len(), "listed source tree");
        if entries.is_empty() {
            return Err(anyhow!("critical path {path} has no files at {commit}"));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpl_vcs::contract::{init_git_repo, run_source_contract_suite};
    use tempfile::tempdir;

    #[test]
    fn git_source_contract() {
        let dir = tempdir().unwrap();
        init_git_repo(dir.path()).unwrap();
        run_source_contract_suite(&GitSource::new(), dir.path()).unwrap();
    }

    #[test]
    fn parses_ls_tree_records() {
        let raw = "100644 blob 3b18e512dba79e4c8300dd08aeb37f8e728b8dad\tbackend/app.txt\0\
                   100755 blob 8baef1b4abc478178b004d62031cf7fe6db6f903\tbackend/run.sh\0";
        let entries = parse_ls_tree(raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].mode, "100755");
        assert_eq!(entries[0].path, "backend/app.txt");
    }

    #[test]
    fn ignored_paths_do_not_dirty_the_tree() {
        let dir = tempdir().unwrap();
        init_git_repo(dir.path()).unwrap();
        std::fs::create_dir_all(dir.path().join(".rpl")).unwrap();
        std::fs::write(dir.path().join(".rpl/rpl.db"), "state").unwrap();

        assert!(!GitSource::new().is_clean(dir.path()).unwrap());
        let git = GitSource::new().ignoring(".rpl");
        assert!(git.is_clean(dir.path()).unwrap());

        std::fs::write(dir.path().join("backend/app.txt"), "edited").unwrap();
        assert!(!git.is_clean(dir.path()).unwrap());
    }

    #[test]
    fn missing_path_is_an_error() {
        let dir = tempdir().unwrap();
        init_git_repo(dir.path()).unwrap();
        let git = GitSource::new();
        let head = git.head_commit(dir.path()).unwrap();
        assert!(git.hash_path_at(dir.path(), &head, "nope").is_err());
    }
}
