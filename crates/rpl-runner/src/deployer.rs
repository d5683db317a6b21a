use std::path::Path;

use anyhow::Context;
use rpl_core::{
    parse_coordinates, BackupId, Component, DeploymentId, DeploymentKind, DeploymentRecord, FailureKind, PipelineState,
    ProvenanceVerdict, ReleaseVersion, StageFailure, StageResult,
};
use rpl_storage::Ledger;
use rpl_vcs::SourceControl;

use crate::config::Config;
use crate::gate::ContentGate;
use crate::stage::StageContext;
use crate::traits::{ArtifactRegistry, Clock, ContainerRuntime, MigrationRunner};
use crate::verify::{expected_provenance, ProvenanceVerifier};

/// What a deploy attempt did to the live environment before it stopped.
#[derive(Clone, Debug, Default)]
pub struct DeployProgress {
    pub swapped: bool,
    pub migrations_ran: bool,
    pub record: Option<DeploymentRecord>,
}

pub struct Deployer<'a> {
    pub source: &'a dyn SourceControl,
    pub runtime: &'a dyn ContainerRuntime,
    pub registry: &'a dyn ArtifactRegistry,
    pub migrations: &'a dyn MigrationRunner,
    pub ledger: &'a dyn Ledger,
    pub clock: &'a dyn Clock,
    pub cfg: &'a Config,
    pub repo_root: &'a Path,
}

impl<'a> Deployer<'a> {
    /// Pull, re-verify, swap containers, migrate, record.
    ///
    /// Nothing live changes until every artifact is pulled and verified. From
    /// the first stop onwards failures are marked as having touched the live
    /// environment, and the swap is not interrupted by cancellation.
    pub fn deploy(
        &self,
        environment: &str,
        version: &ReleaseVersion,
        backup_id: Option<BackupId>,
        skip_migrations: bool,
        progress: &mut DeployProgress,
    ) -> StageResult<DeploymentRecord> {
        let stage = PipelineState::Deploying;
        let components = self.cfg.component_list().stage_err(stage, FailureKind::Precondition)?;
        let targets: Vec<(Component, String)> = components
            .iter()
            .map(|c| (c.clone(), self.cfg.coordinates(c, &version.tag)))
            .collect();

        for (_, coordinates) in &targets {
            self.registry
                .pull(coordinates)
                .with_context(|| format!("pull {coordinates}"))
                .stage_err(stage, FailureKind::DeployFailure)?;
        }

        let expected = expected_provenance(
            self.source,
            self.repo_root,
            &self.cfg.project.critical_path,
            version,
            stage,
        )?;
        let verifier = ProvenanceVerifier { runtime: self.runtime };
        let gate = ContentGate { runtime: self.runtime, cfg: self.cfg };
        for (component, coordinates) in &targets {
            if verifier.verify_image(stage, coordinates, &expected)? == ProvenanceVerdict::Degraded {
                gate.admit_degraded(stage, component, coordinates)?;
            }
        }

        let previous = self
            .ledger
            .active_deployment(environment)
            .stage_err(stage, FailureKind::DeployFailure)?;

        tracing::info!(environment, version = %version, "swapping containers");
        progress.swapped = true;
        for component in &components {
            self.runtime
                .stop(component)
                .with_context(|| format!("stop {component}"))
                .map_err(|e| StageFailure::new(stage, FailureKind::DeployFailure, format!("{e:#}")).touched())?;
        }
        for (component, coordinates) in &targets {
            self.runtime
                .start(component, coordinates)
                .with_context(|| format!("start {coordinates}"))
                .map_err(|e| StageFailure::new(stage, FailureKind::DeployFailure, format!("{e:#}")).touched())?;
        }

        if skip_migrations {
            tracing::warn!(environment, "migrations skipped by operator");
        } else if let Err(e) = self.migrations.migrate(environment) {
            let detail =
                self.reinstate_previous(environment, &components, previous.as_ref(), backup_id.as_ref(), &format!("{e:#}"));
            return Err(StageFailure::new(stage, FailureKind::MigrationFailure, detail).touched());
        } else {
            progress.migrations_ran = true;
        }

        let record = DeploymentRecord {
            id: DeploymentId::new(),
            environment: environment.to_string(),
            version: version.tag.clone(),
            artifacts: targets.into_iter().map(|(_, c)| c).collect(),
            deployed_at: self.clock.now(),
            previous_version: previous.map(|r| r.version),
            kind: DeploymentKind::Deploy,
            migrations_ran: progress.migrations_ran,
            backup_id,
        };
        self.ledger
            .append_deployment(&record)
            .map_err(|e| StageFailure::new(stage, FailureKind::DeployFailure, format!("{e:#}")).touched())?;
        tracing::info!(environment, version = %record.version, previous = ?record.previous_version, "deployed");
        progress.record = Some(record.clone());
        Ok(record)
    }

    /// After a failed migration: stop the new containers and start the
    /// superseded release again. The store is left as the migration left it;
    /// the pre-deploy backup is kept for the operator. Returns the failure detail.
    fn reinstate_previous(
        &self,
        environment: &str,
        components: &[Component],
        previous: Option<&DeploymentRecord>,
        backup_id: Option<&BackupId>,
        cause: &str,
    ) -> String {
        let mut problems = Vec::new();
        for component in components {
            if let Err(e) = self.runtime.stop(component) {
                problems.push(format!("stop {component}: {e:#}"));
            }
        }
        let mut running = Vec::new();
        for coordinates in previous.map(|r| r.artifacts.as_slice()).unwrap_or_default() {
            let Some((component, _)) = parse_coordinates(coordinates) else {
                problems.push(format!("unrecognised coordinates {coordinates}"));
                continue;
            };
            match self.runtime.start(&component, coordinates) {
                Ok(()) => running.push(coordinates.clone()),
                Err(e) => problems.push(format!("start {coordinates}: {e:#}")),
            }
        }

        let backup = match backup_id {
            Some(id) => format!("backup {id} preserved for manual recovery"),
            None => "no pre-deploy backup was taken".to_string(),
        };
        let running = if running.is_empty() { "nothing".to_string() } else { running.join(", ") };
        tracing::error!(
            environment,
            backup = ?backup_id,
            running = %running,
            "migration failed; store not restored, manual intervention required"
        );
        let mut detail = format!("{cause}; store not restored, {backup}; running: {running}");
        for problem in problems {
            detail.push_str("; ");
            detail.push_str(&problem);
        }
        detail.push_str("; manual intervention required");
        detail
    }
}
