use serde::{Deserialize, Serialize};

use crate::{CoreError, FailureKind};

/// Overall pipeline state machine.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Building,
    Verifying,
    Testing,
    Gating,
    Publishing,
    BackingUp,
    Deploying,
    HealthChecking,
    Done,
    RollingBack,
    RolledBack,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageEvent {
    Succeeded,
    Failed { kind: FailureKind, live_touched: bool },
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Building => "building",
            PipelineState::Verifying => "verifying",
            PipelineState::Testing => "testing",
            PipelineState::Gating => "gating",
            PipelineState::Publishing => "publishing",
            PipelineState::BackingUp => "backing_up",
            PipelineState::Deploying => "deploying",
            PipelineState::HealthChecking => "health_checking",
            PipelineState::Done => "done",
            PipelineState::RollingBack => "rolling_back",
            PipelineState::RolledBack => "rolled_back",
            PipelineState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::RolledBack | PipelineState::Failed)
    }

    /// Stages that run before anything on the target environment changes.
    pub fn precedes_deploy(&self) -> bool {
        matches!(
            self,
            PipelineState::Idle
                | PipelineState::Building
                | PipelineState::Verifying
                | PipelineState::Testing
                | PipelineState::Gating
                | PipelineState::Publishing
                | PipelineState::BackingUp
        )
    }

    fn successor(&self) -> Option<PipelineState> {
        Some(match self {
            PipelineState::Idle => PipelineState::Building,
            PipelineState::Building => PipelineState::Verifying,
            PipelineState::Verifying => PipelineState::Testing,
            PipelineState::Testing => PipelineState::Gating,
            PipelineState::Gating => PipelineState::Publishing,
            PipelineState::Publishing => PipelineState::BackingUp,
            PipelineState::BackingUp => PipelineState::Deploying,
            PipelineState::Deploying => PipelineState::HealthChecking,
            PipelineState::HealthChecking => PipelineState::Done,
            PipelineState::RollingBack => PipelineState::RolledBack,
            PipelineState::Done | PipelineState::RolledBack | PipelineState::Failed => return None,
        })
    }

    /// Pure transition function.
    ///
    /// Failures before Deploying go straight to Failed. A deploy or health
    /// failure that touched the live environment moves to RollingBack; a
    /// migration or provenance failure during deploy does not.
    pub fn next(self, event: StageEvent) -> Result<PipelineState, CoreError> {
        let invalid = || CoreError::InvalidTransition { from: self, event };
        match event {
            StageEvent::Succeeded => self.successor().ok_or_else(invalid),
            StageEvent::Failed { kind, live_touched } => {
                if self.is_terminal() || self == PipelineState::Idle {
                    return Err(invalid());
                }
                if self.precedes_deploy() || self == PipelineState::RollingBack {
                    return Ok(PipelineState::Failed);
                }
                if live_touched && kind.triggers_rollback() {
                    Ok(PipelineState::RollingBack)
                } else {
                    Ok(PipelineState::Failed)
                }
            }
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the walk through the state machine for one pipeline run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTrail {
    pub current: PipelineState,
    pub visited: Vec<PipelineState>,
}

impl Default for StateTrail {
    fn default() -> Self {
        Self {
            current: PipelineState::Idle,
            visited: vec![PipelineState::Idle],
        }
    }
}

impl StateTrail {
    /// Start somewhere other than Idle, e.g. a deploy-only invocation.
    pub fn starting_at(state: PipelineState) -> Self {
        Self {
            current: state,
            visited: vec![state],
        }
    }

    pub fn apply(&mut self, event: StageEvent) -> Result<PipelineState, CoreError> {
        let next = self.current.next(event)?;
        self.current = next;
        self.visited.push(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail(kind: FailureKind, live_touched: bool) -> StageEvent {
        StageEvent::Failed { kind, live_touched }
    }

    #[test]
    fn happy_path_walks_every_stage() {
        let mut trail = StateTrail::default();
        while !trail.current.is_terminal() {
            trail.apply(StageEvent::Succeeded).unwrap();
        }
        assert_eq!(
            trail.visited,
            vec![
                PipelineState::Idle,
                PipelineState::Building,
                PipelineState::Verifying,
                PipelineState::Testing,
                PipelineState::Gating,
                PipelineState::Publishing,
                PipelineState::BackingUp,
                PipelineState::Deploying,
                PipelineState::HealthChecking,
                PipelineState::Done,
            ]
        );
    }

    #[test]
    fn fatal_before_deploy_goes_straight_to_failed() {
        for state in [
            PipelineState::Building,
            PipelineState::Verifying,
            PipelineState::Testing,
            PipelineState::Gating,
            PipelineState::Publishing,
            PipelineState::BackingUp,
        ] {
            let next = state.next(fail(FailureKind::DeployFailure, true)).unwrap();
            assert_eq!(next, PipelineState::Failed, "{state}");
        }
    }

    #[test]
    fn health_failure_rolls_back() {
        let next = PipelineState::HealthChecking
            .next(fail(FailureKind::HealthCheckFailure, true))
            .unwrap();
        assert_eq!(next, PipelineState::RollingBack);
        assert_eq!(next.next(StageEvent::Succeeded).unwrap(), PipelineState::RolledBack);
        assert_eq!(
            next.next(fail(FailureKind::RollbackFailure, true)).unwrap(),
            PipelineState::Failed
        );
    }

    #[test]
    fn deploy_failures_route_by_kind_and_touch() {
        let d = PipelineState::Deploying;
        assert_eq!(d.next(fail(FailureKind::DeployFailure, true)).unwrap(), PipelineState::RollingBack);
        assert_eq!(d.next(fail(FailureKind::DeployFailure, false)).unwrap(), PipelineState::Failed);
        assert_eq!(d.next(fail(FailureKind::MigrationFailure, true)).unwrap(), PipelineState::Failed);
        assert_eq!(d.next(fail(FailureKind::ProvenanceMismatch, false)).unwrap(), PipelineState::Failed);
    }

    #[test]
    fn terminal_states_reject_events() {
        assert!(PipelineState::Done.next(StageEvent::Succeeded).is_err());
        assert!(PipelineState::Failed.next(fail(FailureKind::BuildFailure, false)).is_err());
        assert!(PipelineState::Idle.next(fail(FailureKind::BuildFailure, false)).is_err());
    }
}
