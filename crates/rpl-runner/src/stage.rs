use rpl_core::{FailureKind, PipelineState, StageFailure, StageResult};

/// Fold a shell error into the failure of the stage it happened in.
pub trait StageContext<T> {
    fn stage_err(self, stage: PipelineState, kind: FailureKind) -> StageResult<T>;
}

impl<T> StageContext<T> for anyhow::Result<T> {
    fn stage_err(self, stage: PipelineState, kind: FailureKind) -> StageResult<T> {
        self.map_err(|e| StageFailure::new(stage, kind, format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn keeps_context_chain() {
        let r: anyhow::Result<()> = Err(anyhow!("exit 1")).context("docker push");
        let f = r.stage_err(PipelineState::Publishing, FailureKind::PublishFailure).unwrap_err();
        assert_eq!(f.kind, FailureKind::PublishFailure);
        assert_eq!(f.detail, "docker push: exit 1");
    }
}
