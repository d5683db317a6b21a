use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rpl_core::{ReleaseVersion, RunId};

use crate::manifest::{EvidenceManifest, EvidenceRole, ReleaseManifest};

pub trait ArtifactStore: Send + Sync {
    fn create_run_dir(&self, project: &str, run_id: &RunId) -> Result<PathBuf>;
    fn write_manifest(&self, run_dir: &Path, manifest: &EvidenceManifest) -> Result<()>;
    fn append_worklog(&self, run_dir: &Path, line: &str) -> Result<()>;
    fn write_role_bytes(&self, run_dir: &Path, role: EvidenceRole, name: &str, bytes: &[u8]) -> Result<PathBuf>;

    fn write_release(&self, project: &str, release: &ReleaseManifest) -> Result<PathBuf>;
    fn load_release(&self, project: &str, tag: &str) -> Result<ReleaseManifest>;
    fn release_exists(&self, project: &str, tag: &str) -> bool;
    /// Newest release by tag order, which is build-time order.
    fn latest_release(&self, project: &str) -> Result<Option<ReleaseManifest>>;
}

#[derive(Clone)]
pub struct FsArtifactStore {
    pub root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn role_dir(role: EvidenceRole) -> &'static str {
        match role {
            EvidenceRole::Build => "build",
            EvidenceRole::Provenance => "provenance",
            EvidenceRole::Tests => "tests",
            EvidenceRole::ContentGate => "content_gate",
            EvidenceRole::Publish => "publish",
            EvidenceRole::Backup => "backup",
            EvidenceRole::Deploy => "deploy",
            EvidenceRole::Health => "health",
            EvidenceRole::Rollback => "rollback",
        }
    }

    fn releases_dir(&self, project: &str) -> PathBuf {
        self.root.join(project).join("releases")
    }

    fn release_path(&self, project: &str, tag: &str) -> PathBuf {
        self.releases_dir(project).join(format!("{tag}.json"))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn create_run_dir(&self, project: &str, run_id: &RunId) -> Result<PathBuf> {
        let dir = self.root.join(project).join("runs").join(run_id.as_str());
        std::fs::create_dir_all(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
        Ok(dir)
    }

    fn write_manifest(&self, run_dir: &Path, manifest: &EvidenceManifest) -> Result<()> {
        let path = run_dir.join("evidence_manifest.json");
        let bytes = serde_json::to_vec_pretty(manifest)?;
        std::fs::write(&path, bytes).with_context(|| format!("write manifest {}", path.display()))?;
        Ok(())
    }

    fn append_worklog(&self, run_dir: &Path, line: &str) -> Result<()> {
        let path = run_dir.join("worklog.md");
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    fn write_role_bytes(&self, run_dir: &Path, role: EvidenceRole, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = run_dir.join(Self::role_dir(role));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    fn write_release(&self, project: &str, release: &ReleaseManifest) -> Result<PathBuf> {
        let dir = self.releases_dir(project);
        std::fs::create_dir_all(&dir).with_context(|| format!("create releases dir {}", dir.display()))?;
        let path = self.release_path(project, &release.version.tag);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(release)?)
            .with_context(|| format!("write release {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("move release into place {}", path.display()))?;
        Ok(path)
    }

    fn load_release(&self, project: &str, tag: &str) -> Result<ReleaseManifest> {
        ReleaseVersion::parse(tag).map_err(|e| anyhow!(e))?;
        let path = self.release_path(project, tag);
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("no release manifest for {tag} at {}", path.display()))?;
        serde_json::from_str(&s).with_context(|| format!("parse release manifest {}", path.display()))
    }

    fn release_exists(&self, project: &str, tag: &str) -> bool {
        self.release_path(project, tag).exists()
    }

    fn latest_release(&self, project: &str) -> Result<Option<ReleaseManifest>> {
        let dir = self.releases_dir(project);
        if !dir.exists() {
            return Ok(None);
        }
        let mut tags = Vec::new();
        for entry in std::fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(tag) = name.strip_suffix(".json") {
                if ReleaseVersion::parse(tag).is_ok() {
                    tags.push(tag.to_string());
                }
            }
        }
        tags.sort();
        match tags.last() {
            Some(tag) => Ok(Some(self.load_release(project, tag)?)),
            None => Ok(None),
        }
    }
}
