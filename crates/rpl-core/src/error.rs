use thiserror::Error;

use crate::engine::{PipelineState, StageEvent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid component name: {0:?}")]
    InvalidComponent(String),

    #[error("invalid commit {0:?}: expected lowercase hex")]
    InvalidCommit(String),

    #[error("invalid release tag {0:?}")]
    InvalidTag(String),

    #[error("tag sequence exhausted for {0} (more than 99 builds in one second)")]
    SequenceExhausted(String),

    #[error("invalid tier policy: {0}")]
    InvalidTierPolicy(String),

    #[error("invalid pipeline transition from {from:?} on {event:?}")]
    InvalidTransition { from: PipelineState, event: StageEvent },
}
