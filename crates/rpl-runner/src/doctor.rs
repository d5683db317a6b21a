use anyhow::{anyhow, Context, Result};
use std::path::Path;

use rpl_suite::load_suite_manifest;
use rpl_vcs::SourceControl;
use crate::pipeline::checkout_source;
use crate::util::run_cmd;
use crate::Config;

/// Preflight for a real checkout. Returns one line per passed check.
pub fn doctor(repo_root: &Path, cfg: &Config) -> Result<Vec<String>> {
    // must be repo root
    let top = run_cmd(repo_root, "git", &["rev-parse", "--show-toplevel"]).context("git rev-parse")?;
    let top = Path::new(&top).canonicalize().with_context(|| format!("canonicalize {top}"))?;
    let here = repo_root.canonicalize().with_context(|| format!("canonicalize {}", repo_root.display()))?;
    if top != here {
        return Err(anyhow!(
            "must run from repo root. expected={}, got={}",
            top.display(),
            here.display()
        ));
    }

    let mut passed = vec![format!("repo root: {}", here.display())];
    passed.extend(check_workspace(repo_root, cfg, &checkout_source())?);

    let docker = run_cmd(repo_root, "docker", &["version", "--format", "{{.Server.Version}}"])
        .context("docker daemon not reachable")?;
    passed.push(format!("docker server {docker}"));
    Ok(passed)
}

/// Checks that only need source control and the config.
pub fn check_workspace(repo_root: &Path, cfg: &Config, source: &dyn SourceControl) -> Result<Vec<String>> {
    let mut passed = Vec::new();

    // clean working tree
    if !source.is_clean(repo_root)? {
        return Err(anyhow!("working tree is dirty; commit or stash changes first"));
    }
    passed.push("working tree clean".to_string());

    cfg.validate()?;
    passed.push(format!("config: {} component(s)", cfg.components.len()));

    let suite_path = cfg.suite_path(repo_root);
    let suite = load_suite_manifest(&suite_path)?;
    let policy = suite.tier_policy(&cfg.test.tier_parallelism)?;
    passed.push(format!(
        "suite {}: {} tests, {} tiers, {} known-slow",
        suite.suite,
        suite.tests.len(),
        policy.tier_count(),
        suite.known_slow.len()
    ));

    let head = source.head_commit(repo_root)?;
    let entries = source
        .tree_at(repo_root, &head, &cfg.project.critical_path)
        .with_context(|| format!("critical path {} at HEAD", cfg.project.critical_path))?;
    if entries.is_empty() {
        return Err(anyhow!("critical path {} has no committed files at {head}", cfg.project.critical_path));
    }
    let hash = rpl_vcs::source_hash(&entries);
    passed.push(format!("critical path {} at {}: {}", cfg.project.critical_path, head, &hash[..12]));

    if cfg.gate.deny.is_empty() {
        tracing::warn!("gate.deny is empty");
    }
    Ok(passed)
}
