use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{FailureKind, PipelineState};

/// Structured failure every stage reports instead of a bare error.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{stage} failed ({kind}): {detail}")]
pub struct StageFailure {
    pub stage: PipelineState,
    pub kind: FailureKind,
    pub detail: String,
    /// Whether anything on the live environment changed before the failure.
    pub live_touched: bool,
}

impl StageFailure {
    pub fn new(stage: PipelineState, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            detail: detail.into(),
            live_touched: false,
        }
    }

    pub fn touched(mut self) -> Self {
        self.live_touched = true;
        self
    }
}

pub type StageResult<T> = Result<T, StageFailure>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RollbackOutcome {
    RolledBack { version: String, restored_backup: bool },
    /// `containers_restored` marks a partial rollback: the previous artifacts
    /// run again but something after that (store restore, verification) failed.
    Failed { detail: String, containers_restored: bool },
}

impl RollbackOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, RollbackOutcome::RolledBack { .. })
    }

    pub fn summary(&self) -> String {
        match self {
            RollbackOutcome::RolledBack { version, restored_backup: true } => {
                format!("rolled back to {version} (store restored from backup)")
            }
            RollbackOutcome::RolledBack { version, .. } => format!("rolled back to {version}"),
            RollbackOutcome::Failed { detail, containers_restored: true } => {
                format!("rollback partially succeeded, manual intervention required: {detail}")
            }
            RollbackOutcome::Failed { detail, .. } => {
                format!("rollback failed, manual intervention required: {detail}")
            }
        }
    }
}

pub const EXIT_OK: i32 = 0;
pub const EXIT_PRECONDITION: i32 = 2;
pub const EXIT_CANCELLED: i32 = 3;
pub const EXIT_ROLLED_BACK: i32 = 20;
pub const EXIT_ROLLBACK_FAILED: i32 = 21;

/// Process exit code for a finished pipeline.
pub fn exit_code(final_state: PipelineState, failure: Option<&FailureKind>) -> i32 {
    match final_state {
        PipelineState::Done => return EXIT_OK,
        PipelineState::RolledBack => return EXIT_ROLLED_BACK,
        _ => {}
    }
    match failure {
        None => EXIT_OK,
        Some(kind) => match kind {
            FailureKind::Precondition => EXIT_PRECONDITION,
            FailureKind::Cancelled => EXIT_CANCELLED,
            FailureKind::BuildFailure => 10,
            FailureKind::ProvenanceMismatch => 11,
            FailureKind::ContentGateViolation => 12,
            FailureKind::TestFailure => 13,
            FailureKind::PublishFailure => 14,
            FailureKind::BackupFailure => 15,
            FailureKind::MigrationFailure => 16,
            FailureKind::DeployFailure | FailureKind::HealthCheckFailure => 17,
            FailureKind::RollbackFailure => EXIT_ROLLBACK_FAILED,
        },
    }
}
