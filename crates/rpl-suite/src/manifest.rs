use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rpl_core::{TestCategory, TestId, TierPolicy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Declarative list of the tests the TestRunner schedules.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuiteManifest {
    pub suite: String,
    pub tests: Vec<SuiteEntry>,
    /// Run again in the final tier as a sanity pass whenever escalation happens.
    #[serde(default)]
    pub known_slow: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuiteEntry {
    pub id: String,
    pub category: TestCategory,
}

pub fn load_suite_manifest(path: &Path) -> Result<SuiteManifest> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read suite manifest: {}", path.display()))?;
    let manifest: SuiteManifest = serde_yaml::from_str(&s).with_context(|| "parse suite manifest yaml")?;
    validate_suite_manifest(&manifest)?;
    Ok(manifest)
}

pub fn save_suite_manifest(path: &Path, manifest: &SuiteManifest) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let s = serde_yaml::to_string(manifest).with_context(|| "serialize suite manifest")?;
    std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub fn validate_suite_manifest(manifest: &SuiteManifest) -> Result<()> {
    if manifest.suite.trim().is_empty() {
        return Err(anyhow!("suite manifest missing suite name"));
    }
    if manifest.tests.is_empty() {
        return Err(anyhow!("suite manifest must list at least one test"));
    }
    let mut seen = BTreeSet::new();
    for entry in &manifest.tests {
        if entry.id.trim().is_empty() {
            return Err(anyhow!("suite manifest contains an empty test id"));
        }
        if !seen.insert(entry.id.as_str()) {
            return Err(anyhow!("duplicate test id in suite manifest: {}", entry.id));
        }
    }
    for slow in &manifest.known_slow {
        if !seen.contains(slow.as_str()) {
            return Err(anyhow!("known_slow entry {slow} is not a test in the suite"));
        }
    }
    Ok(())
}

impl SuiteManifest {
    pub fn test_map(&self) -> BTreeMap<TestId, TestCategory> {
        self.tests
            .iter()
            .map(|e| (TestId::from_str(e.id.clone()), e.category))
            .collect()
    }

    pub fn known_slow_set(&self) -> BTreeSet<TestId> {
        self.known_slow.iter().map(|s| TestId::from_str(s.clone())).collect()
    }

    pub fn tier_policy(&self, parallelism: &[usize]) -> Result<TierPolicy> {
        TierPolicy::new(parallelism.to_vec(), self.known_slow_set()).map_err(|e| anyhow!(e))
    }

    /// Keep only the tests whose id contains `filter`.
    pub fn filtered(&self, filter: &str) -> SuiteManifest {
        let tests: Vec<SuiteEntry> = self.tests.iter().filter(|e| e.id.contains(filter)).cloned().collect();
        let kept: BTreeSet<&str> = tests.iter().map(|e| e.id.as_str()).collect();
        SuiteManifest {
            suite: self.suite.clone(),
            known_slow: self.known_slow.iter().filter(|s| kept.contains(s.as_str())).cloned().collect(),
            tests,
        }
    }
}

/// Stable digest of the suite: entries are sorted by id before hashing.
pub fn suite_hash(manifest: &SuiteManifest) -> String {
    let mut tests: Vec<(&str, &str)> = manifest
        .tests
        .iter()
        .map(|e| (e.id.as_str(), e.category.as_str()))
        .collect();
    tests.sort();
    let mut slow: Vec<&str> = manifest.known_slow.iter().map(|s| s.as_str()).collect();
    slow.sort();
    let canonical = serde_json::json!({
        "suite": manifest.suite,
        "tests": tests,
        "known_slow": slow,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
