use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use rpl_core::{
    parse_coordinates, rollback_target, BackupId, Component, DeploymentId, DeploymentKind, DeploymentRecord,
    RollbackOutcome,
};
use rpl_storage::Ledger;

use crate::backup::BackupManager;
use crate::traits::{ArtifactRegistry, Clock, ContainerRuntime};

/// Why a rollback runs, which decides its target and whether the store is restored.
#[derive(Clone, Debug)]
pub enum RollbackPlan {
    /// Operator asked for it. Without `version` the superseded record of the
    /// active deployment is re-activated.
    Explicit { version: Option<String>, restore_store: bool },
    /// A deploy failed after touching the live environment. `record` is the
    /// record it appended, if it got that far.
    AfterFailedDeploy {
        record: Option<DeploymentRecord>,
        migrations_ran: bool,
        backup_id: Option<BackupId>,
    },
}

pub struct RollbackManager<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub registry: &'a dyn ArtifactRegistry,
    pub ledger: &'a dyn Ledger,
    pub clock: &'a dyn Clock,
    pub backups: &'a BackupManager<'a>,
}

enum Restore {
    Skip,
    From(BackupId),
    /// Restore was needed but is impossible; containers are still brought back.
    Missing(String),
}

struct Resolved {
    target: DeploymentRecord,
    restore: Restore,
    append: bool,
}

impl<'a> RollbackManager<'a> {
    fn resolve(&self, environment: &str, plan: &RollbackPlan) -> Result<Resolved> {
        let history = self.ledger.deployments(environment)?;
        match plan {
            RollbackPlan::Explicit { version, restore_store } => {
                let (active, earlier) = history
                    .split_last()
                    .ok_or_else(|| anyhow!("nothing has been deployed to {environment}"))?;
                let target = match version {
                    None => rollback_target(&history)
                        .cloned()
                        .ok_or_else(|| anyhow!("{} has no earlier release to roll back to", active.version))?,
                    Some(v) if v == &active.version => return Err(anyhow!("{v} is already active on {environment}")),
                    Some(v) => earlier
                        .iter()
                        .rev()
                        .find(|r| &r.version == v)
                        .cloned()
                        .ok_or_else(|| anyhow!("{v} was never deployed to {environment}"))?,
                };
                let restore = match (*restore_store, &active.backup_id) {
                    (false, _) => Restore::Skip,
                    (true, Some(id)) => Restore::From(id.clone()),
                    (true, None) => {
                        return Err(anyhow!("active deployment {} has no pre-deploy backup", active.version))
                    }
                };
                Ok(Resolved { target, restore, append: true })
            }
            RollbackPlan::AfterFailedDeploy { record, migrations_ran, backup_id } => {
                let (target, append) = match record {
                    Some(_) => (rollback_target(&history).cloned(), true),
                    None => (history.last().cloned(), false),
                };
                let target = target.ok_or_else(|| anyhow!("no earlier deployment on {environment} to roll back to"))?;
                let restore = match (*migrations_ran, backup_id) {
                    (false, _) => Restore::Skip,
                    (true, Some(id)) => Restore::From(id.clone()),
                    (true, None) => {
                        Restore::Missing("migrations ran but no pre-deploy backup exists (backup was skipped)".into())
                    }
                };
                Ok(Resolved { target, restore, append })
            }
        }
    }

    /// Re-activate an earlier deployment from already-published artifacts.
    pub fn rollback(&self, environment: &str, plan: &RollbackPlan) -> RollbackOutcome {
        let failed = |detail: String, containers_restored: bool| RollbackOutcome::Failed { detail, containers_restored };

        let resolved = match self.resolve(environment, plan) {
            Ok(r) => r,
            Err(e) => return failed(format!("{e:#}"), false),
        };
        let target = &resolved.target;
        tracing::warn!(environment, target = %target.version, "rolling back");

        let wanted = match Self::targets(target) {
            Ok(w) => w,
            Err(e) => return failed(format!("{e:#}"), false),
        };
        if let Err(e) = self.pull_all(target) {
            return failed(format!("{e:#}"), false);
        }
        if let Err(e) = self.stop_all(&wanted) {
            return failed(format!("{e:#}"), false);
        }

        let restore_problem = match &resolved.restore {
            Restore::Skip => None,
            Restore::Missing(why) => Some(why.clone()),
            Restore::From(id) => self
                .backups
                .find(environment, id)
                .and_then(|snapshot| self.backups.restore(environment, &snapshot))
                .err()
                .map(|e| format!("store restore failed: {e:#}")),
        };

        for (component, coordinates) in &wanted {
            if let Err(e) = self.runtime.start(component, coordinates) {
                return failed(format!("start {coordinates}: {e:#}"), false);
            }
        }

        if resolved.append {
            let record = DeploymentRecord {
                id: DeploymentId::new(),
                environment: environment.to_string(),
                version: target.version.clone(),
                artifacts: target.artifacts.clone(),
                deployed_at: self.clock.now(),
                previous_version: target.previous_version.clone(),
                kind: DeploymentKind::Rollback,
                migrations_ran: false,
                backup_id: target.backup_id.clone(),
            };
            if let Err(e) = self.ledger.append_deployment(&record) {
                return failed(format!("containers restored but ledger append failed: {e:#}"), true);
            }
        }

        if let Err(e) = self.verify_running(&target.version, &wanted) {
            return failed(format!("{e:#}"), true);
        }
        if let Some(problem) = restore_problem {
            tracing::error!(environment, problem = %problem, "store not restored");
            return failed(problem, true);
        }
        let restored_backup = matches!(resolved.restore, Restore::From(_));
        tracing::info!(environment, version = %target.version, restored_backup, "rolled back");
        RollbackOutcome::RolledBack { version: target.version.clone(), restored_backup }
    }

    fn targets(target: &DeploymentRecord) -> Result<BTreeMap<Component, String>> {
        target
            .artifacts
            .iter()
            .map(|coordinates| {
                parse_coordinates(coordinates)
                    .map(|(component, _)| (component, coordinates.clone()))
                    .ok_or_else(|| anyhow!("cannot parse artifact coordinates {coordinates}"))
            })
            .collect()
    }

    fn pull_all(&self, target: &DeploymentRecord) -> Result<()> {
        for coordinates in &target.artifacts {
            self.registry.pull(coordinates).with_context(|| format!("pull {coordinates}"))?;
        }
        Ok(())
    }

    fn stop_all(&self, wanted: &BTreeMap<Component, String>) -> Result<()> {
        let mut components: BTreeSet<Component> = self.runtime.running_images()?.into_keys().collect();
        components.extend(wanted.keys().cloned());
        for component in &components {
            self.runtime.stop(component).with_context(|| format!("stop {component}"))?;
        }
        Ok(())
    }

    /// Running images must be exactly the target's, tag for tag.
    fn verify_running(&self, version: &str, wanted: &BTreeMap<Component, String>) -> Result<()> {
        let running = self.runtime.running_images()?;
        if &running != wanted {
            return Err(anyhow!("running images {running:?} differ from {version} artifacts {wanted:?}"));
        }
        Ok(())
    }
}
