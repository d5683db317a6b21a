use std::path::Path;

use anyhow::Context;
use rpl_artifacts::{decode_provenance, PROVENANCE_LABEL};
use rpl_core::{
    verify_provenance, ExpectedProvenance, FailureKind, FieldMismatch, PipelineState, ProvenanceVerdict,
    ReleaseVersion, StageFailure, StageResult,
};
use rpl_vcs::SourceControl;

use crate::stage::StageContext;
use crate::traits::ContainerRuntime;

/// Provenance the checkout expects for artifacts of `version`: the full
/// commit the tag was derived from and the digest of `critical_path` there.
pub fn expected_provenance(
    source: &dyn SourceControl,
    repo_root: &Path,
    critical_path: &str,
    version: &ReleaseVersion,
    stage: PipelineState,
) -> StageResult<ExpectedProvenance> {
    let git_commit = source
        .resolve_commit(repo_root, &version.commit_short)
        .with_context(|| format!("resolve commit of {version}"))
        .stage_err(stage, FailureKind::ProvenanceMismatch)?;
    let source_hash = source
        .hash_path_at(repo_root, &git_commit, critical_path)
        .stage_err(stage, FailureKind::ProvenanceMismatch)?;
    Ok(ExpectedProvenance { git_commit, source_hash })
}

/// Cross-checks the provenance label of an image against the checkout.
pub struct ProvenanceVerifier<'a> {
    pub runtime: &'a dyn ContainerRuntime,
}

impl<'a> ProvenanceVerifier<'a> {
    /// Verdict for one image. A mismatch, including an unreadable label, is
    /// returned as a `ProvenanceMismatch` failure; `Degraded` is left to the
    /// caller, which must fall back to the content scan.
    pub fn verify_image(
        &self,
        stage: PipelineState,
        image_ref: &str,
        expected: &ExpectedProvenance,
    ) -> StageResult<ProvenanceVerdict> {
        let label = self
            .runtime
            .read_label(image_ref, PROVENANCE_LABEL)
            .stage_err(stage, FailureKind::ProvenanceMismatch)?;

        let verdict = match decode_provenance(label.as_deref()) {
            Ok(embedded) => verify_provenance(embedded.as_ref(), expected),
            Err(e) => ProvenanceVerdict::Mismatch(vec![FieldMismatch {
                field: "label",
                expected: "provenance JSON document".to_string(),
                found: format!("{e:#}"),
            }]),
        };

        match &verdict {
            ProvenanceVerdict::Verified => {
                tracing::info!(image = %image_ref, commit = %expected.git_commit, "provenance verified");
            }
            ProvenanceVerdict::Degraded => {
                tracing::warn!(
                    image = %image_ref,
                    "artifact carries no provenance metadata; falling back to content scan"
                );
            }
            ProvenanceVerdict::Mismatch(_) => {
                tracing::error!(image = %image_ref, mismatch = %verdict.describe(), "provenance mismatch");
                return Err(StageFailure::new(
                    stage,
                    FailureKind::ProvenanceMismatch,
                    format!("{image_ref}: {}", verdict.describe()),
                ));
            }
        }
        Ok(verdict)
    }
}
