use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};

use crate::types::SourceControl;

/// Shared contract for `SourceControl` implementations backed by a real
/// repository. `repo_root` must come from `init_git_repo`.
pub fn run_source_contract_suite(source: &dyn SourceControl, repo_root: &Path) -> Result<()> {
    if !source.is_clean(repo_root)? {
        return Err(anyhow!("repo root must be clean for contract tests"));
    }

    let first = source.head_commit(repo_root)?;
    if first.len() < 40 || !first.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!("head commit is not a full hex id: {first}"));
    }
    if source.resolve_commit(repo_root, &first[..7])? != first {
        return Err(anyhow!("short id did not resolve to head"));
    }
    let h1 = source.hash_path_at(repo_root, &first, "backend")?;
    if h1 != source.hash_path_at(repo_root, &first, "backend")? {
        return Err(anyhow!("source hash is not deterministic"));
    }

    // uncommitted edits never leak into the hash of a commit
    std::fs::write(repo_root.join("backend/app.txt"), "dirty")?;
    if source.is_clean(repo_root)? {
        return Err(anyhow!("expected dirty tree after edit"));
    }
    if source.hash_path_at(repo_root, &first, "backend")? != h1 {
        return Err(anyhow!("working tree changes affected the committed hash"));
    }
    run(repo_root, &["git", "checkout", "--", "backend/app.txt"])?;

    std::fs::write(repo_root.join("README.md"), "docs only")?;
    run(repo_root, &["git", "commit", "-am", "docs"])?;
    let second = source.head_commit(repo_root)?;
    if second == first {
        return Err(anyhow!("expected head to advance"));
    }
    if source.hash_path_at(repo_root, &second, "backend")? != h1 {
        return Err(anyhow!("change outside the critical path altered its hash"));
    }

    std::fs::write(repo_root.join("backend/app.txt"), "v2")?;
    run(repo_root, &["git", "commit", "-am", "backend change"])?;
    let third = source.head_commit(repo_root)?;
    if source.hash_path_at(repo_root, &third, "backend")? == h1 {
        return Err(anyhow!("critical path change did not alter its hash"));
    }
    Ok(())
}

/// Initialize a minimal git repo fixture with one commit that contains
/// `README.md` and `backend/app.txt`.
pub fn init_git_repo(dir: &Path) -> Result<()> {
    run(dir, &["git", "init"])?;
    run(dir, &["git", "config", "user.email", "rpl@example.com"])?;
    run(dir, &["git", "config", "user.name", "rpl"])?;
    std::fs::write(dir.join("README.md"), "fixture")?;
    std::fs::create_dir_all(dir.join("backend"))?;
    std::fs::write(dir.join("backend/app.txt"), "v1")?;
    run(dir, &["git", "add", "."])?;
    run(dir, &["git", "commit", "-m", "init"])?;
    Ok(())
}

fn run(dir: &Path, args: &[&str]) -> Result<()> {
    let mut cmd = Command::new(args[0]);
    cmd.args(&args[1..]).current_dir(dir);
    let out = cmd.output().with_context(|| format!("run {:?}", args))?;
    if !out.status.success() {
        return Err(anyhow!(
            "command failed: {:?}\nstdout:{}\nstderr:{}",
            args,
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        ));
    }
    Ok(())
}
