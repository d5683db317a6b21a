use std::time::Duration;

use rpl_core::{Component, FailureKind, PipelineState, StageFailure, StageResult};

use crate::traits::{Clock, HealthProbe};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy { rounds: u32, waited: Duration },
    /// `max_wait` ran out; `unhealthy` is what the last round saw.
    Unhealthy { rounds: u32, unhealthy: Vec<Component> },
}

/// Polls liveness until one round sees every component healthy or time runs out.
pub struct HealthVerifier<'a> {
    pub probe: &'a dyn HealthProbe,
    pub clock: &'a dyn Clock,
    pub interval: Duration,
    pub max_wait: Duration,
}

impl<'a> HealthVerifier<'a> {
    pub fn wait(&self, components: &[Component]) -> HealthVerdict {
        let started = self.clock.now();
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            let unhealthy: Vec<Component> = components
                .iter()
                .filter(|c| match self.probe.probe(c) {
                    Ok(healthy) => !healthy,
                    Err(e) => {
                        tracing::debug!(component = %c, error = %format!("{e:#}"), "probe error");
                        true
                    }
                })
                .cloned()
                .collect();

            let waited = (self.clock.now() - started).to_std().unwrap_or(Duration::ZERO);
            if !components.is_empty() && unhealthy.is_empty() {
                tracing::info!(rounds, waited_ms = waited.as_millis() as u64, "all components healthy");
                return HealthVerdict::Healthy { rounds, waited };
            }
            if waited >= self.max_wait {
                return HealthVerdict::Unhealthy { rounds, unhealthy };
            }
            tracing::debug!(round = rounds, unhealthy = unhealthy.len(), "not healthy yet");
            self.clock.sleep(self.interval.min(self.max_wait - waited));
        }
    }

    pub fn check(&self, components: &[Component]) -> StageResult<()> {
        match self.wait(components) {
            HealthVerdict::Healthy { .. } => Ok(()),
            HealthVerdict::Unhealthy { rounds, unhealthy } => {
                let names: Vec<&str> = unhealthy.iter().map(|c| c.as_str()).collect();
                Err(StageFailure::new(
                    PipelineState::HealthChecking,
                    FailureKind::HealthCheckFailure,
                    format!(
                        "not healthy after {}s ({rounds} rounds): {}",
                        self.max_wait.as_secs(),
                        if names.is_empty() { "no components".to_string() } else { names.join(", ") }
                    ),
                )
                .touched())
            }
        }
    }
}
