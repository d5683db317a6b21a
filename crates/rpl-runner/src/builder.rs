use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rpl_artifacts::{encode_provenance, PROVENANCE_LABEL};
use rpl_core::{Artifact, FailureKind, PipelineState, ProvenanceRecord, ReleaseVersion, StageFailure, StageResult};
use rpl_vcs::SourceControl;

use crate::config::{ComponentConfig, Config};
use crate::stage::StageContext;
use crate::traits::{BuildRequest, ContainerRuntime};

pub const VERSION_LABEL: &str = "org.rpl.version";

/// Provenance for `commit`, computed once per release.
pub fn compute_provenance(
    source: &dyn SourceControl,
    repo_root: &Path,
    commit: &str,
    critical_path: &str,
    now: DateTime<Utc>,
) -> StageResult<ProvenanceRecord> {
    let source_hash = source
        .hash_path_at(repo_root, commit, critical_path)
        .stage_err(PipelineState::Building, FailureKind::BuildFailure)?;
    Ok(ProvenanceRecord {
        git_commit: commit.to_string(),
        build_date: now,
        source_hash,
    })
}

pub struct Builder<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub cfg: &'a Config,
    pub repo_root: &'a Path,
}

impl<'a> Builder<'a> {
    fn request(
        &self,
        component: &ComponentConfig,
        version: &ReleaseVersion,
        label: &str,
    ) -> anyhow::Result<BuildRequest> {
        let c = component.component()?;
        let mut labels = BTreeMap::new();
        labels.insert(PROVENANCE_LABEL.to_string(), label.to_string());
        labels.insert(VERSION_LABEL.to_string(), version.tag.clone());
        Ok(BuildRequest {
            image_ref: self.cfg.local_image_ref(&c, &version.tag),
            context: self.repo_root.join(&component.context),
            dockerfile: component.dockerfile.as_ref().map(|d| self.repo_root.join(d)),
            component: c,
            labels,
            no_cache: component.no_cache,
        })
    }

    fn build_one(
        &self,
        component: &ComponentConfig,
        version: &ReleaseVersion,
        provenance: &ProvenanceRecord,
        label: &str,
    ) -> anyhow::Result<Artifact> {
        let request = self.request(component, version, label)?;
        tracing::info!(component = %request.component, image = %request.image_ref, no_cache = request.no_cache, "building");
        self.runtime.build(&request)?;
        Ok(Artifact {
            component: request.component,
            version: version.clone(),
            provenance: provenance.clone(),
            content_ref: request.image_ref,
        })
    }

    /// One artifact per configured component. Any failure fails the build.
    pub fn build_all(&self, version: &ReleaseVersion, provenance: &ProvenanceRecord) -> StageResult<Vec<Artifact>> {
        let stage = PipelineState::Building;
        let label = encode_provenance(provenance).stage_err(stage, FailureKind::BuildFailure)?;

        let results: Vec<(String, anyhow::Result<Artifact>)> = if self.cfg.build.parallel {
            self.cfg
                .components
                .par_iter()
                .map(|c| (c.name.clone(), self.build_one(c, version, provenance, &label)))
                .collect()
        } else {
            self.cfg
                .components
                .iter()
                .map(|c| (c.name.clone(), self.build_one(c, version, provenance, &label)))
                .collect()
        };

        let mut artifacts = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(a) => artifacts.push(a),
                Err(e) => {
                    tracing::error!(component = %name, error = %format!("{e:#}"), "build failed");
                    failures.push(format!("{name}: {e:#}"));
                }
            }
        }
        if !failures.is_empty() {
            return Err(StageFailure::new(stage, FailureKind::BuildFailure, failures.join("; ")));
        }
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeRuntime;
    use rpl_artifacts::decode_provenance;
    use rpl_core::Component;

    fn provenance() -> ProvenanceRecord {
        ProvenanceRecord {
            git_commit: "abc1234def".into(),
            build_date: Utc::now(),
            source_hash: "ff".into(),
        }
    }

    #[test]
    fn stamps_every_component() {
        let runtime = FakeRuntime::new();
        let cfg = Config::default_for_repo("shop");
        let version = ReleaseVersion::derive("abc1234def", Utc::now(), 7).unwrap();
        let builder = Builder { runtime: &runtime, cfg: &cfg, repo_root: Path::new("/repo") };
        let artifacts = builder.build_all(&version, &provenance()).unwrap();
        assert_eq!(artifacts.len(), 2);
        for a in &artifacts {
            let label = runtime.read_label(&a.content_ref, PROVENANCE_LABEL).unwrap();
            let decoded = decode_provenance(label.as_deref()).unwrap().unwrap();
            assert_eq!(decoded.git_commit, "abc1234def");
        }
        assert!(runtime.built_no_cache(&cfg.local_image_ref(&Component::Frontend, &version.tag)));
    }

    #[test]
    fn one_failed_component_fails_the_build() {
        let runtime = FakeRuntime::new();
        runtime.fail_build(Component::Backend);
        let cfg = Config::default_for_repo("shop");
        let version = ReleaseVersion::derive("abc1234def", Utc::now(), 7).unwrap();
        let builder = Builder { runtime: &runtime, cfg: &cfg, repo_root: Path::new("/repo") };
        let err = builder.build_all(&version, &provenance()).unwrap_err();
        assert_eq!(err.kind, FailureKind::BuildFailure);
        assert!(err.detail.contains("backend"));
    }
}
