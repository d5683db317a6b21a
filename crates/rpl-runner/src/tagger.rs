use std::path::Path;

use chrono::{DateTime, Utc};
use rpl_core::{FailureKind, PipelineState, ReleaseVersion, StageFailure, StageResult};
use rpl_vcs::SourceControl;

use crate::stage::StageContext;

/// Derives the release identifier for the checked-out commit.
pub struct VersionTagger<'a> {
    pub source: &'a dyn SourceControl,
    pub short_len: usize,
}

#[derive(Clone, Debug)]
pub struct TaggedCommit {
    pub version: ReleaseVersion,
    pub commit: String,
}

impl<'a> VersionTagger<'a> {
    /// `is_taken` reports tags already used by earlier releases.
    pub fn tag(
        &self,
        repo_root: &Path,
        now: DateTime<Utc>,
        is_taken: impl Fn(&str) -> bool,
    ) -> StageResult<TaggedCommit> {
        let stage = PipelineState::Building;
        let clean = self.source.is_clean(repo_root).stage_err(stage, FailureKind::Precondition)?;
        if !clean {
            return Err(StageFailure::new(
                stage,
                FailureKind::Precondition,
                "working tree has uncommitted changes; commit or stash them before building",
            ));
        }
        let commit = self.source.head_commit(repo_root).stage_err(stage, FailureKind::Precondition)?;
        let base = ReleaseVersion::derive(&commit, now, self.short_len)
            .map_err(|e| StageFailure::new(stage, FailureKind::Precondition, e.to_string()))?;
        let version = base
            .next_free(is_taken)
            .map_err(|e| StageFailure::new(stage, FailureKind::Precondition, e.to_string()))?;
        if version.sequence > 0 {
            tracing::info!(tag = %version, "tag collision, using sequence suffix");
        }
        Ok(TaggedCommit { version, commit })
    }
}
