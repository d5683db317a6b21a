use anyhow::Context;
use chrono::{DateTime, Utc};
use rpl_artifacts::ReleaseManifest;
use rpl_core::{FailureKind, PipelineState, StageFailure, StageResult};

use crate::config::Config;
use crate::stage::StageContext;
use crate::traits::{ArtifactRegistry, ContainerRuntime};

pub struct Publisher<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub registry: &'a dyn ArtifactRegistry,
    pub cfg: &'a Config,
}

impl<'a> Publisher<'a> {
    /// Push every artifact of a verified, tested and gated release. Pushing
    /// the same release again overwrites the registry copies.
    pub fn publish(&self, release: &mut ReleaseManifest, now: DateTime<Utc>) -> StageResult<Vec<String>> {
        let stage = PipelineState::Publishing;
        if !release.ready_to_publish() {
            return Err(StageFailure::new(
                stage,
                FailureKind::Precondition,
                format!(
                    "{} is not publishable (verified={}, tests_passed={}, gate_passed={})",
                    release.version,
                    release.verified,
                    release.tests_passed(),
                    release.gate_passed()
                ),
            ));
        }

        let mut pushed = Vec::with_capacity(release.artifacts.len());
        for artifact in &release.artifacts {
            let coordinates = self.cfg.coordinates(&artifact.component, &release.version.tag);
            let result = self
                .runtime
                .tag(&artifact.content_ref, &coordinates)
                .and_then(|_| self.registry.push(&coordinates))
                .with_context(|| format!("publish {coordinates}"));
            if let Err(e) = result {
                release.published.clear();
                release.published_at = None;
                return Err(e).stage_err(stage, FailureKind::PublishFailure);
            }
            tracing::info!(component = %artifact.component, coordinates = %coordinates, "pushed");
            pushed.push(coordinates);
        }

        release.published = pushed.clone();
        release.published_at = Some(now);
        Ok(pushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::fakes::FakeRuntime;
    use chrono::Utc;
    use rpl_artifacts::{GateSummary, TestSummary};
    use rpl_core::{ProvenanceRecord, ReleaseVersion, TieredRun};
    use std::path::Path;

    fn release(runtime: &FakeRuntime, cfg: &Config) -> ReleaseManifest {
        let version = ReleaseVersion::derive("abc1234", Utc::now(), 7).unwrap();
        let provenance = ProvenanceRecord {
            git_commit: "abc1234".into(),
            build_date: Utc::now(),
            source_hash: "aa".into(),
        };
        let builder = Builder { runtime, cfg, repo_root: Path::new("/repo") };
        let artifacts = builder.build_all(&version, &provenance).unwrap();
        ReleaseManifest::new(version, provenance, artifacts)
    }

    fn approve(release: &mut ReleaseManifest) {
        release.verified = true;
        release.tests = Some(TestSummary {
            suite_hash: "h".into(),
            passed: true,
            highest_tier: 1,
            ultimately_failed: vec![],
            run: TieredRun::default(),
            finished_at: Utc::now(),
        });
        release.gate = Some(GateSummary {
            passed: true,
            scanned: vec![],
            not_scanned: vec![],
            hits: vec![],
            finished_at: Utc::now(),
        });
    }

    #[test]
    fn refuses_untested_release() {
        let runtime = FakeRuntime::new();
        let cfg = Config::default_for_repo("shop");
        let mut rel = release(&runtime, &cfg);
        rel.verified = true;
        let publisher = Publisher { runtime: &runtime, registry: &runtime, cfg: &cfg };
        let err = publisher.publish(&mut rel, Utc::now()).unwrap_err();
        assert_eq!(err.kind, FailureKind::Precondition);
        assert!(!rel.is_published());
    }

    #[test]
    fn publishes_under_release_coordinates() {
        let runtime = FakeRuntime::new();
        let cfg = Config::default_for_repo("shop");
        let mut rel = release(&runtime, &cfg);
        approve(&mut rel);
        let publisher = Publisher { runtime: &runtime, registry: &runtime, cfg: &cfg };
        let pushed = publisher.publish(&mut rel, Utc::now()).unwrap();
        assert_eq!(pushed.len(), 2);
        for c in &pushed {
            assert!(c.starts_with("registry.local/shop:"));
            assert!(c.ends_with(&rel.version.tag));
            assert!(runtime.is_published(c));
        }
        assert!(rel.is_published());
        // republishing is idempotent
        publisher.publish(&mut rel, Utc::now()).unwrap();
    }

    #[test]
    fn push_failure_leaves_release_unpublished() {
        let runtime = FakeRuntime::new();
        runtime.fail_push();
        let cfg = Config::default_for_repo("shop");
        let mut rel = release(&runtime, &cfg);
        approve(&mut rel);
        let publisher = Publisher { runtime: &runtime, registry: &runtime, cfg: &cfg };
        let err = publisher.publish(&mut rel, Utc::now()).unwrap_err();
        assert_eq!(err.kind, FailureKind::PublishFailure);
        assert!(!rel.is_published());
    }
}
