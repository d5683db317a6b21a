use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use rpl_core::{Component, TierPolicy, DEFAULT_TIER_PARALLELISM};

use crate::util::expand_path;

/// Repo-relative directory holding the config, suite and ledger. Source
/// control ignores it when deciding whether the checkout is clean.
pub const STATE_DIR: &str = ".rpl";

/// Shortest and longest accepted `project.short_commit_len`.
pub const SHORT_COMMIT_LEN: std::ops::RangeInclusive<usize> = 4..=40;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub project: ProjectConfig,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub build: BuildConfig,
    pub components: Vec<ComponentConfig>,
    pub test: TestConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub health: HealthConfig,
    pub backup: BackupConfig,
    pub deploy: DeployConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    /// Path whose committed content feeds `source_hash`.
    pub critical_path: String,
    #[serde(default = "default_short_len")]
    pub short_commit_len: usize,
    pub artifact_root: String,
}

fn default_short_len() -> usize {
    7
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub namespace: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildConfig {
    pub parallel: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self { parallel: true }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    /// Build context, relative to the repo root.
    pub context: String,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub no_cache: bool,
    /// Directory inside the image holding the static payload the content gate scans.
    #[serde(default)]
    pub payload_path: Option<String>,
    /// Liveness URL; container health status is used when unset.
    #[serde(default)]
    pub health_url: Option<String>,
    /// Extra `docker run` arguments (ports, env files, networks).
    #[serde(default)]
    pub run_args: Vec<String>,
}

impl ComponentConfig {
    pub fn component(&self) -> Result<Component> {
        Component::parse(&self.name).map_err(|e| anyhow!(e))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestConfig {
    pub suite: String,
    /// Command run once per test id. `{test}` and `{tier}` are substituted.
    pub command: Vec<String>,
    #[serde(default = "default_tiers")]
    pub tier_parallelism: Vec<usize>,
    pub environment: String,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: i64,
}

fn default_tiers() -> Vec<usize> {
    DEFAULT_TIER_PARALLELISM.to_vec()
}

fn default_lock_ttl() -> i64 {
    3600
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Literal byte strings that must never ship.
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub max_wait_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_wait_secs: 120,
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupConfig {
    pub root: String,
    /// Writes a dump of the store to stdout. `{env}` is substituted.
    pub dump_command: Vec<String>,
    /// Reads a dump from stdin.
    pub restore_command: Vec<String>,
    #[serde(default = "default_keep")]
    pub keep: usize,
}

fn default_keep() -> usize {
    10
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployConfig {
    pub environment: String,
    pub migrate_command: Vec<String>,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: i64,
}

impl Config {
    pub fn default_for_repo(project_id: &str) -> Self {
        Self {
            project: ProjectConfig {
                id: project_id.to_string(),
                critical_path: "backend".to_string(),
                short_commit_len: default_short_len(),
                artifact_root: "~/.rpl/artifacts".to_string(),
            },
            registry: RegistryConfig {
                namespace: "registry.local".to_string(),
            },
            build: BuildConfig::default(),
            components: vec![
                ComponentConfig {
                    name: "frontend".to_string(),
                    context: "frontend".to_string(),
                    dockerfile: None,
                    no_cache: true,
                    payload_path: Some("/usr/share/nginx/html".to_string()),
                    health_url: Some("http://localhost:3000/".to_string()),
                    run_args: vec!["-p".to_string(), "3000:80".to_string()],
                },
                ComponentConfig {
                    name: "backend".to_string(),
                    context: "backend".to_string(),
                    dockerfile: None,
                    no_cache: false,
                    payload_path: None,
                    health_url: Some("http://localhost:8000/health".to_string()),
                    run_args: vec!["-p".to_string(), "8000:8000".to_string()],
                },
            ],
            test: TestConfig {
                suite: ".rpl/suite.yaml".to_string(),
                command: vec!["make".to_string(), "test-one".to_string(), "TEST={test}".to_string()],
                tier_parallelism: default_tiers(),
                environment: "test".to_string(),
                lock_ttl_secs: default_lock_ttl(),
            },
            gate: GateConfig::default(),
            health: HealthConfig::default(),
            backup: BackupConfig {
                root: "~/.rpl/backups".to_string(),
                dump_command: vec!["./scripts/db-dump.sh".to_string(), "{env}".to_string()],
                restore_command: vec!["./scripts/db-restore.sh".to_string(), "{env}".to_string()],
                keep: default_keep(),
            },
            deploy: DeployConfig {
                environment: "production".to_string(),
                migrate_command: vec!["./scripts/migrate.sh".to_string(), "{env}".to_string()],
                lock_ttl_secs: default_lock_ttl(),
            },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| "parse rpl.toml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.components.is_empty() {
            return Err(anyhow!("config lists no components"));
        }
        let mut seen = BTreeSet::new();
        for c in &self.components {
            let component = c.component()?;
            if !seen.insert(component.clone()) {
                return Err(anyhow!("component {component} configured twice"));
            }
        }
        if self.project.critical_path.trim().is_empty() {
            return Err(anyhow!("project.critical_path must not be empty"));
        }
        if !SHORT_COMMIT_LEN.contains(&self.project.short_commit_len) {
            return Err(anyhow!(
                "project.short_commit_len must be within {}..={}, got {}",
                SHORT_COMMIT_LEN.start(),
                SHORT_COMMIT_LEN.end(),
                self.project.short_commit_len
            ));
        }
        if self.test.command.is_empty() {
            return Err(anyhow!("test.command must not be empty"));
        }
        if self.health.interval_secs == 0 {
            return Err(anyhow!("health.interval_secs must be positive"));
        }
        if self.test.environment == self.deploy.environment {
            return Err(anyhow!("test and deploy environments must differ"));
        }
        TierPolicy::new(self.test.tier_parallelism.clone(), BTreeSet::new()).map_err(|e| anyhow!(e))?;
        Ok(())
    }

    pub fn component(&self, component: &Component) -> Option<&ComponentConfig> {
        self.components.iter().find(|c| c.name == component.as_str())
    }

    pub fn component_list(&self) -> Result<Vec<Component>> {
        self.components.iter().map(|c| c.component()).collect()
    }

    /// Local image reference a build produces before it is published.
    pub fn local_image_ref(&self, component: &Component, tag: &str) -> String {
        format!("{}-{}:{}", self.project.id, component, tag)
    }

    pub fn coordinates(&self, component: &Component, tag: &str) -> String {
        rpl_core::artifact_coordinates(&self.registry.namespace, &self.project.id, component, tag)
    }

    pub fn suite_path(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.test.suite)
    }

    pub fn artifact_root(&self) -> PathBuf {
        expand_path(&self.project.artifact_root)
    }

    pub fn backup_root(&self) -> PathBuf {
        expand_path(&self.backup.root)
    }

    pub fn config_path(repo_root: &Path) -> PathBuf {
        repo_root.join(STATE_DIR).join("rpl.toml")
    }

    pub fn db_path(repo_root: &Path) -> PathBuf {
        repo_root.join(STATE_DIR).join("rpl.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_roundtrips_through_toml() {
        let dir = tempdir().unwrap();
        let path = Config::config_path(dir.path());
        Config::default_for_repo("shop").save_to(&path).unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.project.id, "shop");
        assert_eq!(cfg.components.len(), 2);
        assert_eq!(cfg.test.tier_parallelism, vec![4, 2, 1]);
        assert_eq!(
            cfg.coordinates(&Component::Backend, "vabc1234-20260205-163600"),
            "registry.local/shop:backend-vabc1234-20260205-163600"
        );
        assert_eq!(cfg.local_image_ref(&Component::Frontend, "v1"), "shop-frontend:v1");
    }

    #[test]
    fn rejects_bad_tier_policy_and_duplicates() {
        let mut cfg = Config::default_for_repo("shop");
        cfg.test.tier_parallelism = vec![2, 2, 1];
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default_for_repo("shop");
        let dup = cfg.components[0].clone();
        cfg.components.push(dup);
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default_for_repo("shop");
        cfg.test.environment = cfg.deploy.environment.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn short_commit_len_is_bounded() {
        let mut cfg = Config::default_for_repo("shop");
        cfg.project.short_commit_len = 3;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("short_commit_len"));
        cfg.project.short_commit_len = 41;
        assert!(cfg.validate().is_err());
        cfg.project.short_commit_len = 4;
        cfg.validate().unwrap();
        cfg.project.short_commit_len = 40;
        cfg.validate().unwrap();
    }

    #[test]
    fn optional_sections_default() {
        let raw = r#"
[project]
id = "shop"
critical_path = "backend"
artifact_root = "/tmp/rpl"

[registry]
namespace = "reg"

[[components]]
name = "backend"
context = "backend"

[test]
suite = ".rpl/suite.yaml"
command = ["make", "test-one", "TEST={test}"]
environment = "test"

[backup]
root = "/tmp/backups"
dump_command = ["dump"]
restore_command = ["restore"]

[deploy]
environment = "production"
migrate_command = []
"#;
        let cfg: Config = toml::from_str(raw).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.project.short_commit_len, 7);
        assert!(cfg.build.parallel);
        assert!(cfg.gate.deny.is_empty());
        assert_eq!(cfg.health.max_wait_secs, 120);
        assert_eq!(cfg.backup.keep, 10);
        assert_eq!(cfg.test.tier_parallelism, vec![4, 2, 1]);
    }
}
