use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;

use rpl_artifacts::{ArtifactStore, EvidenceManifest, EvidenceRole, FsArtifactStore, ReleaseManifest, StageRecord};
use rpl_core::{
    exit_code, BackupId, BackupSnapshot, Component, DeploymentRecord, FailureKind, LockId, PipelineState,
    ProvenanceVerdict, ReleaseVersion, RollbackOutcome, RunId, StageEvent, StageFailure, StageResult, StageStatus,
    StateTrail, TestCategory, EXIT_OK, EXIT_ROLLBACK_FAILED, EXIT_ROLLED_BACK,
};
use rpl_storage::{EnvLock, Ledger, StageEntry};
use rpl_storage_sqlite::SqliteLedger;
use rpl_suite::{load_suite_manifest, save_suite_manifest, suite_hash, SuiteEntry, SuiteManifest};
use rpl_vcs::SourceControl;
use rpl_vcs_git::GitSource;

use crate::backup::BackupManager;
use crate::builder::{compute_provenance, Builder};
use crate::cancel::CancelToken;
use crate::commands::{CommandMigrationRunner, CommandStoreBackup, CommandTestExecutor};
use crate::config::{Config, STATE_DIR};
use crate::deployer::{DeployProgress, Deployer};
use crate::docker::DockerRuntime;
use crate::doctor::doctor;
use crate::gate::{violation, ContentGate};
use crate::health::HealthVerifier;
use crate::probes::ServiceProbe;
use crate::publisher::Publisher;
use crate::rollback::{RollbackManager, RollbackPlan};
use crate::stage::StageContext;
use crate::tagger::VersionTagger;
use crate::testing::{summarize, test_failure, TestRunner};
use crate::traits::{
    ArtifactRegistry, Clock, ContainerRuntime, HealthProbe, MigrationRunner, StoreBackup, SystemClock, TestExecutor,
};
use crate::verify::{expected_provenance, ProvenanceVerifier};

/// Git view of a checkout that does not count the pipeline's own state as local changes.
pub fn checkout_source() -> GitSource {
    GitSource::new().ignoring(STATE_DIR)
}

/// Everything the pipeline talks to outside its own process.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceControl>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub registry: Arc<dyn ArtifactRegistry>,
    pub backup: Arc<dyn StoreBackup>,
    pub migrations: Arc<dyn MigrationRunner>,
    pub probe: Arc<dyn HealthProbe>,
    pub tests: Arc<dyn TestExecutor>,
    pub clock: Arc<dyn Clock>,
    pub ledger: Arc<dyn Ledger>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub backup_root: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub struct TestOptions {
    /// Release tag; the newest local release when unset.
    pub release: Option<String>,
    pub load_prod_data: bool,
    /// Substring filter on test ids. Filtered runs are not recorded on the release.
    pub filter: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct DeployOptions {
    pub version: String,
    pub skip_backup: bool,
    pub skip_migrations: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RollbackOptions {
    pub version: Option<String>,
    pub restore_store: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub load_prod_data: bool,
    pub skip_backup: bool,
    pub skip_migrations: bool,
}

/// Result of one pipeline invocation.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineReport {
    pub run_id: RunId,
    pub command: String,
    pub trail: StateTrail,
    pub release: Option<String>,
    pub failure: Option<StageFailure>,
    /// Deploy or health failure that handed control to the RollbackManager.
    pub trigger: Option<StageFailure>,
    pub rollback: Option<RollbackOutcome>,
}

impl PipelineReport {
    pub fn exit_code(&self) -> i32 {
        if self.trigger.is_some() {
            return match &self.rollback {
                Some(outcome) if outcome.succeeded() => EXIT_ROLLED_BACK,
                _ => EXIT_ROLLBACK_FAILED,
            };
        }
        match &self.failure {
            Some(f) => exit_code(self.trail.current, Some(&f.kind)),
            None => EXIT_OK,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code() == EXIT_OK
    }

    pub fn summary(&self) -> String {
        let release = self.release.as_deref().unwrap_or("-");
        match (&self.trigger, &self.rollback, &self.failure) {
            (Some(trigger), Some(outcome), _) => {
                format!("{} {release}: {trigger}; {}", self.command, outcome.summary())
            }
            (_, _, Some(failure)) => format!("{} {release}: {failure}", self.command),
            (None, Some(outcome), None) => format!("{}: {}", self.command, outcome.summary()),
            _ => format!("{} {release}: ok ({})", self.command, self.trail.current),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StatusReport {
    pub environment: String,
    pub active: Option<DeploymentRecord>,
    pub lock: Option<EnvLock>,
    pub latest_release: Option<ReleaseManifest>,
    pub recent_stages: Vec<StageEntry>,
}

/// What a deploy did before it failed; feeds the automatic rollback.
#[derive(Default)]
struct DeployAttempt {
    progress: DeployProgress,
    backup_id: Option<BackupId>,
}

pub struct Pipeline {
    pub repo_root: PathBuf,
    pub cfg: Config,
    pub collab: Collaborators,
    pub cancel: CancelToken,
}

impl Pipeline {
    pub fn new(repo_root: PathBuf, cfg: Config, collab: Collaborators, cancel: CancelToken) -> Self {
        Self { repo_root, cfg, collab, cancel }
    }

    /// Wire the real collaborators for a checkout. Writes a default config on first use.
    pub fn open(repo_root: PathBuf, cancel: CancelToken) -> Result<Self> {
        let cfg_path = Config::config_path(&repo_root);
        let cfg = if cfg_path.exists() {
            Config::load_from(&cfg_path)?
        } else {
            let project_id = repo_root.file_name().and_then(|s| s.to_str()).unwrap_or("repo");
            let cfg = Config::default_for_repo(project_id);
            cfg.save_to(&cfg_path)?;
            cfg
        };

        let ledger = SqliteLedger::open(&Config::db_path(&repo_root))?;

        let mut docker = DockerRuntime::new(repo_root.clone(), cfg.project.id.clone());
        let mut urls = BTreeMap::new();
        for c in &cfg.components {
            let component = c.component()?;
            if let Some(url) = &c.health_url {
                urls.insert(component.clone(), url.clone());
            }
            docker = docker.with_run_args(component, c.run_args.clone());
        }
        let runtime = Arc::new(docker);
        let probe = ServiceProbe::new(urls, runtime.clone(), Duration::from_secs(cfg.health.probe_timeout_secs))?;

        let collab = Collaborators {
            source: Arc::new(checkout_source()),
            runtime: runtime.clone(),
            registry: runtime,
            backup: Arc::new(CommandStoreBackup {
                workdir: repo_root.clone(),
                dump_command: cfg.backup.dump_command.clone(),
                restore_command: cfg.backup.restore_command.clone(),
            }),
            migrations: Arc::new(CommandMigrationRunner {
                workdir: repo_root.clone(),
                command: cfg.deploy.migrate_command.clone(),
            }),
            probe: Arc::new(probe),
            tests: Arc::new(CommandTestExecutor {
                workdir: repo_root.clone(),
                command: cfg.test.command.clone(),
                environment: cfg.test.environment.clone(),
            }),
            clock: Arc::new(SystemClock),
            ledger: Arc::new(ledger),
            artifacts: Arc::new(FsArtifactStore::new(cfg.artifact_root())),
            backup_root: cfg.backup_root(),
        };
        Ok(Self::new(repo_root, cfg, collab, cancel))
    }

    pub fn init_repo(repo_root: &Path) -> Result<()> {
        let cfg_path = Config::config_path(repo_root);
        let project_id = repo_root.file_name().and_then(|s| s.to_str()).unwrap_or("repo");
        let cfg = if cfg_path.exists() {
            Config::load_from(&cfg_path)?
        } else {
            let cfg = Config::default_for_repo(project_id);
            cfg.save_to(&cfg_path)?;
            cfg
        };
        let suite_path = cfg.suite_path(repo_root);
        if !suite_path.exists() {
            let starter = SuiteManifest {
                suite: cfg.project.id.clone(),
                tests: vec![SuiteEntry { id: "smoke".to_string(), category: TestCategory::Unit }],
                known_slow: vec![],
            };
            save_suite_manifest(&suite_path, &starter)?;
        }
        // create db
        let _ = SqliteLedger::open(&Config::db_path(repo_root))?;
        Ok(())
    }

    pub fn doctor(&self) -> Result<Vec<String>> {
        doctor(&self.repo_root, &self.cfg)
    }

    /// Idle → Building → Verifying.
    pub fn build(&self) -> PipelineReport {
        let mut ctx = self.begin("build", StateTrail::default());
        let result = self.build_stages(&mut ctx).map(|_| ());
        ctx.finish(result)
    }

    /// Verifying → Testing, against an already built and verified release.
    pub fn test(&self, opts: &TestOptions) -> PipelineReport {
        let mut ctx = self.begin("test", StateTrail::starting_at(PipelineState::Verifying));
        let result = self.test_stages(&mut ctx, opts);
        ctx.finish(result)
    }

    /// Testing → Gating → Publishing.
    pub fn push(&self, release: Option<&str>) -> PipelineReport {
        let mut ctx = self.begin("push", StateTrail::starting_at(PipelineState::Testing));
        let result = self.push_stages(&mut ctx, release);
        ctx.finish(result)
    }

    /// Publishing → BackingUp → Deploying → HealthChecking → Done, rolling
    /// back when the live environment was touched and the deploy failed.
    pub fn deploy(&self, opts: &DeployOptions) -> PipelineReport {
        let mut ctx = self.begin("deploy", StateTrail::starting_at(PipelineState::Publishing));
        let mut attempt = DeployAttempt::default();
        let result = self.deploy_stages(&mut ctx, &opts.version, opts.skip_backup, opts.skip_migrations, &mut attempt);
        self.conclude_deploy(ctx, result, attempt)
    }

    /// Operator-requested rollback; needs no build.
    pub fn rollback(&self, opts: &RollbackOptions) -> PipelineReport {
        let mut ctx = self.begin("rollback", StateTrail::starting_at(PipelineState::RollingBack));
        let environment = self.cfg.deploy.environment.clone();
        if let Err(f) = ctx.lock(&environment, self.cfg.deploy.lock_ttl_secs) {
            return ctx.finish(Err(f));
        }
        let plan = RollbackPlan::Explicit { version: opts.version.clone(), restore_store: opts.restore_store };
        self.roll_back(&mut ctx, &plan);
        ctx.into_report()
    }

    /// The whole chain from the current checkout to a healthy deploy.
    pub fn run(&self, opts: &RunOptions) -> PipelineReport {
        let mut ctx = self.begin("run", StateTrail::default());
        let mut attempt = DeployAttempt::default();
        let result = self.run_stages(&mut ctx, opts, &mut attempt);
        self.conclude_deploy(ctx, result, attempt)
    }

    pub fn status(&self) -> Result<StatusReport> {
        let c = &self.collab;
        let environment = self.cfg.deploy.environment.clone();
        Ok(StatusReport {
            active: c.ledger.active_deployment(&environment)?,
            lock: c.ledger.current_lock(&environment, c.clock.now())?,
            latest_release: c.artifacts.latest_release(&self.cfg.project.id)?,
            recent_stages: c.ledger.recent_stages(20)?,
            environment,
        })
    }

    /// Deployment records of `environment` (the deploy environment by default), oldest first.
    pub fn history(&self, environment: Option<&str>) -> Result<Vec<DeploymentRecord>> {
        self.collab
            .ledger
            .deployments(environment.unwrap_or(&self.cfg.deploy.environment))
    }

    pub fn backup_list(&self, environment: Option<&str>) -> Result<Vec<BackupSnapshot>> {
        self.backups().list(environment.unwrap_or(&self.cfg.deploy.environment))
    }

    pub fn backup_prune(&self, environment: Option<&str>, keep: Option<usize>) -> Result<Vec<BackupSnapshot>> {
        let environment = environment.unwrap_or(&self.cfg.deploy.environment);
        let keep = keep.unwrap_or(self.cfg.backup.keep);
        if keep == 0 {
            return Err(anyhow!("refusing to prune every backup of {environment}; keep must be at least 1"));
        }
        let removed = self.backups().prune(environment, keep)?;
        tracing::info!(environment, keep, removed = removed.len(), "backups pruned");
        Ok(removed)
    }

    fn backups(&self) -> BackupManager<'_> {
        BackupManager {
            backup: &*self.collab.backup,
            ledger: &*self.collab.ledger,
            clock: &*self.collab.clock,
            root: &self.collab.backup_root,
        }
    }

    fn begin(&self, command: &'static str, trail: StateTrail) -> RunCtx<'_> {
        let c = &self.collab;
        let run_id = RunId::new();
        let run_dir = match c.artifacts.create_run_dir(&self.cfg.project.id, &run_id) {
            Ok(dir) => Some(dir),
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "no run directory; evidence will not be written");
                None
            }
        };
        let evidence = EvidenceManifest {
            run_id: run_id.to_string(),
            command: command.to_string(),
            release: None,
            environment: None,
            started_at: c.clock.now(),
            final_state: None,
            stages: vec![],
        };
        let ctx = RunCtx {
            ledger: &*c.ledger,
            artifacts: &*c.artifacts,
            clock: &*c.clock,
            cancel: &self.cancel,
            holder: format!("rpl-{}:{command}", std::process::id()),
            run_id,
            command,
            run_dir,
            evidence,
            pending: vec![],
            trail,
            locks: vec![],
            release: None,
            failure: None,
            trigger: None,
            rollback: None,
        };
        ctx.worklog(&format!("## {command} run {}", ctx.run_id));
        tracing::info!(run_id = %ctx.run_id, command, from = %ctx.trail.current, "pipeline run started");
        ctx
    }

    fn load_release(&self, tag: Option<&str>, stage: PipelineState) -> StageResult<ReleaseManifest> {
        let artifacts = &self.collab.artifacts;
        let project = &self.cfg.project.id;
        match tag {
            Some(tag) => artifacts.load_release(project, tag).stage_err(stage, FailureKind::Precondition),
            None => artifacts
                .latest_release(project)
                .stage_err(stage, FailureKind::Precondition)?
                .ok_or_else(|| StageFailure::new(stage, FailureKind::Precondition, "no release has been built yet")),
        }
    }

    fn save_release(&self, release: &ReleaseManifest, stage: PipelineState, kind: FailureKind) -> StageResult<()> {
        self.collab
            .artifacts
            .write_release(&self.cfg.project.id, release)
            .map(|_| ())
            .stage_err(stage, kind)
    }

    fn build_stages(&self, ctx: &mut RunCtx) -> StageResult<ReleaseManifest> {
        let c = &self.collab;
        let project = &self.cfg.project.id;

        let stage = ctx.advance()?;
        let now = c.clock.now();
        let tagger = VersionTagger { source: &*c.source, short_len: self.cfg.project.short_commit_len };
        let tagged = tagger.tag(&self.repo_root, now, |tag| c.artifacts.release_exists(project, tag))?;
        ctx.release = Some(tagged.version.tag.clone());
        tracing::info!(tag = %tagged.version, commit = %tagged.commit, "release tagged");

        let provenance =
            compute_provenance(&*c.source, &self.repo_root, &tagged.commit, &self.cfg.project.critical_path, now)?;
        let builder = Builder { runtime: &*c.runtime, cfg: &self.cfg, repo_root: &self.repo_root };
        let artifacts = builder.build_all(&tagged.version, &provenance)?;
        let mut release = ReleaseManifest::new(tagged.version.clone(), provenance, artifacts);
        self.save_release(&release, stage, FailureKind::BuildFailure)?;
        ctx.evidence_json(EvidenceRole::Build, "artifacts.json", &release.artifacts);
        ctx.pass(format!("{} artifact(s) tagged {}", release.artifacts.len(), release.version));

        let stage = ctx.advance()?;
        self.verify_release(&mut release, stage)?;
        self.save_release(&release, stage, FailureKind::ProvenanceMismatch)?;
        ctx.evidence_json(EvidenceRole::Provenance, "provenance.json", &release.provenance);
        let detail = if release.degraded.is_empty() {
            format!("commit {}", release.provenance.git_commit)
        } else {
            format!("degraded: {}", release.degraded.join(", "))
        };
        ctx.pass(detail);
        Ok(release)
    }

    /// Every artifact must carry the provenance the checkout expects, or pass
    /// the content scan when it carries none.
    fn verify_release(&self, release: &mut ReleaseManifest, stage: PipelineState) -> StageResult<()> {
        let c = &self.collab;
        let expected = expected_provenance(
            &*c.source,
            &self.repo_root,
            &self.cfg.project.critical_path,
            &release.version,
            stage,
        )?;
        let verifier = ProvenanceVerifier { runtime: &*c.runtime };
        let gate = ContentGate { runtime: &*c.runtime, cfg: &self.cfg };
        release.degraded.clear();
        for artifact in &release.artifacts {
            if verifier.verify_image(stage, &artifact.content_ref, &expected)? == ProvenanceVerdict::Degraded {
                gate.admit_degraded(stage, &artifact.component, &artifact.content_ref)?;
                release.degraded.push(artifact.component.to_string());
            }
        }
        release.verified = true;
        Ok(())
    }

    fn test_stages(&self, ctx: &mut RunCtx, opts: &TestOptions) -> StageResult<()> {
        let stage = ctx.advance()?;
        let mut release = self.load_release(opts.release.as_deref(), stage)?;
        ctx.release = Some(release.version.tag.clone());
        if !release.verified {
            return Err(StageFailure::new(
                stage,
                FailureKind::Precondition,
                format!("{} has not passed provenance verification; run build first", release.version),
            ));
        }
        self.run_tests(ctx, &mut release, opts.load_prod_data, opts.filter.as_deref())
    }

    fn run_tests(
        &self,
        ctx: &mut RunCtx,
        release: &mut ReleaseManifest,
        load_prod_data: bool,
        filter: Option<&str>,
    ) -> StageResult<()> {
        let stage = PipelineState::Testing;
        let c = &self.collab;
        let environment = self.cfg.test.environment.clone();
        ctx.lock(&environment, self.cfg.test.lock_ttl_secs)?;

        let suite = load_suite_manifest(&self.cfg.suite_path(&self.repo_root)).stage_err(stage, FailureKind::Precondition)?;
        let suite = match filter {
            Some(f) => {
                let narrowed = suite.filtered(f);
                if narrowed.tests.is_empty() {
                    return Err(StageFailure::new(stage, FailureKind::Precondition, format!("no test id contains {f:?}")));
                }
                narrowed
            }
            None => suite,
        };
        let policy = suite
            .tier_policy(&self.cfg.test.tier_parallelism)
            .stage_err(stage, FailureKind::Precondition)?;

        if load_prod_data {
            self.load_prod_data(&environment)?;
        }

        let runner = TestRunner { executor: &*c.tests, cancel: &self.cancel };
        let run = runner.run(&suite.test_map(), &policy)?;
        let summary = summarize(&suite_hash(&suite), &run, c.clock.now());
        ctx.evidence_json(EvidenceRole::Tests, "summary.json", &summary);

        if filter.is_none() {
            release.tests = Some(summary);
            self.save_release(release, stage, FailureKind::TestFailure)?;
        } else {
            tracing::warn!(release = %release.version, "filtered test run is not recorded on the release");
        }
        if !run.passed() {
            return Err(test_failure(&run));
        }
        ctx.pass(format!("{} tests passed, highest tier {}", suite.tests.len(), run.highest_tier()));
        Ok(())
    }

    /// Load the newest production snapshot into the test store.
    fn load_prod_data(&self, test_env: &str) -> StageResult<()> {
        let stage = PipelineState::Testing;
        let prod = &self.cfg.deploy.environment;
        let backups = self.backups();
        let snapshot = backups
            .latest(prod)
            .stage_err(stage, FailureKind::Precondition)?
            .ok_or_else(|| {
                StageFailure::new(stage, FailureKind::Precondition, format!("no {prod} backup to load into {test_env}"))
            })?;
        backups
            .restore(test_env, &snapshot)
            .stage_err(stage, FailureKind::TestFailure)?;
        tracing::info!(environment = test_env, backup = %snapshot.id, taken_at = %snapshot.taken_at, "production data loaded");
        Ok(())
    }

    fn push_stages(&self, ctx: &mut RunCtx, tag: Option<&str>) -> StageResult<()> {
        let stage = ctx.advance()?;
        let mut release = self.load_release(tag, stage)?;
        ctx.release = Some(release.version.tag.clone());
        self.gate_and_publish(ctx, &mut release)
    }

    /// Gating then Publishing. Expects the trail to be at Gating.
    fn gate_and_publish(&self, ctx: &mut RunCtx, release: &mut ReleaseManifest) -> StageResult<()> {
        let c = &self.collab;
        let stage = PipelineState::Gating;
        if !release.verified || !release.tests_passed() {
            return Err(StageFailure::new(
                stage,
                FailureKind::Precondition,
                format!("{} has no passing test run; run test first", release.version),
            ));
        }
        let images: Vec<(Component, String)> = release
            .artifacts
            .iter()
            .map(|a| (a.component.clone(), a.content_ref.clone()))
            .collect();
        let gate = ContentGate { runtime: &*c.runtime, cfg: &self.cfg };
        let summary = gate
            .scan(&images, c.clock.now())
            .stage_err(stage, FailureKind::ContentGateViolation)?;
        ctx.evidence_json(EvidenceRole::ContentGate, "gate.json", &summary);
        release.gate = Some(summary.clone());
        self.save_release(release, stage, FailureKind::ContentGateViolation)?;
        if !summary.passed {
            return Err(violation(stage, &summary));
        }
        ctx.pass(format!("scanned {}", summary.scanned.join(", ")));

        let stage = ctx.advance()?;
        let publisher = Publisher { runtime: &*c.runtime, registry: &*c.registry, cfg: &self.cfg };
        let published = publisher.publish(release, c.clock.now());
        let saved = self.save_release(release, stage, FailureKind::PublishFailure);
        let pushed = published?;
        saved?;
        ctx.evidence_json(EvidenceRole::Publish, "published.json", &pushed);
        ctx.pass(format!("{} artifact(s) pushed", pushed.len()));
        Ok(())
    }

    fn deploy_stages(
        &self,
        ctx: &mut RunCtx,
        tag: &str,
        skip_backup: bool,
        skip_migrations: bool,
        attempt: &mut DeployAttempt,
    ) -> StageResult<()> {
        let c = &self.collab;
        let environment = self.cfg.deploy.environment.clone();

        let stage = ctx.advance()?;
        ctx.lock(&environment, self.cfg.deploy.lock_ttl_secs)?;
        let version = ReleaseVersion::parse(tag).map_err(|e| StageFailure::new(stage, FailureKind::Precondition, e.to_string()))?;
        ctx.release = Some(version.tag.clone());
        self.check_published(&version, stage)?;

        if skip_backup {
            tracing::warn!(environment = %environment, "pre-deploy backup skipped; a failed migration cannot be undone");
            ctx.skip("skipped by operator");
        } else {
            let snapshot = self.backups().take(&environment)?;
            ctx.evidence_json(EvidenceRole::Backup, "snapshot.json", &snapshot);
            attempt.backup_id = Some(snapshot.id.clone());
            ctx.pass(format!("backup {}", snapshot.id));
        }

        ctx.advance()?;
        let deployer = Deployer {
            source: &*c.source,
            runtime: &*c.runtime,
            registry: &*c.registry,
            migrations: &*c.migrations,
            ledger: &*c.ledger,
            clock: &*c.clock,
            cfg: &self.cfg,
            repo_root: &self.repo_root,
        };
        let record = deployer.deploy(
            &environment,
            &version,
            attempt.backup_id.clone(),
            skip_migrations,
            &mut attempt.progress,
        )?;
        ctx.evidence_json(EvidenceRole::Deploy, "record.json", &record);
        ctx.pass(format!("{} active, previous {}", record.version, record.previous_version.as_deref().unwrap_or("none")));

        let stage = ctx.advance()?;
        let components = self.cfg.component_list().stage_err(stage, FailureKind::Precondition)?;
        let health = HealthVerifier {
            probe: &*c.probe,
            clock: &*c.clock,
            interval: Duration::from_secs(self.cfg.health.interval_secs),
            max_wait: Duration::from_secs(self.cfg.health.max_wait_secs),
        };
        health.check(&components)?;
        ctx.pass(format!("{} component(s) healthy", components.len()));
        ctx.advance()?;
        Ok(())
    }

    /// A release built here must have been pushed before it is deployed.
    /// Releases built elsewhere are only known to the registry.
    fn check_published(&self, version: &ReleaseVersion, stage: PipelineState) -> StageResult<()> {
        let artifacts = &self.collab.artifacts;
        let project = &self.cfg.project.id;
        if !artifacts.release_exists(project, &version.tag) {
            tracing::warn!(tag = %version, "no local release manifest; relying on registry provenance");
            return Ok(());
        }
        let release = artifacts
            .load_release(project, &version.tag)
            .stage_err(stage, FailureKind::Precondition)?;
        if !release.is_published() {
            return Err(StageFailure::new(
                stage,
                FailureKind::Precondition,
                format!("{version} was never published; run push first"),
            ));
        }
        Ok(())
    }

    fn run_stages(&self, ctx: &mut RunCtx, opts: &RunOptions, attempt: &mut DeployAttempt) -> StageResult<()> {
        let mut release = self.build_stages(ctx)?;
        ctx.advance()?;
        self.run_tests(ctx, &mut release, opts.load_prod_data, None)?;
        ctx.advance()?;
        self.gate_and_publish(ctx, &mut release)?;
        let tag = release.version.tag.clone();
        self.deploy_stages(ctx, &tag, opts.skip_backup, opts.skip_migrations, attempt)
    }

    fn conclude_deploy(&self, mut ctx: RunCtx, result: StageResult<()>, attempt: DeployAttempt) -> PipelineReport {
        let failure = match result {
            Ok(()) => return ctx.into_report(),
            Err(f) => f,
        };
        if ctx.fail(failure) != PipelineState::RollingBack {
            return ctx.into_report();
        }
        ctx.trigger = ctx.failure.take();
        let plan = RollbackPlan::AfterFailedDeploy {
            record: attempt.progress.record,
            migrations_ran: attempt.progress.migrations_ran,
            backup_id: attempt.backup_id,
        };
        self.roll_back(&mut ctx, &plan);
        ctx.into_report()
    }

    /// Expects the trail to be at RollingBack.
    fn roll_back(&self, ctx: &mut RunCtx, plan: &RollbackPlan) {
        let c = &self.collab;
        let environment = &self.cfg.deploy.environment;
        let backups = self.backups();
        let manager = RollbackManager {
            runtime: &*c.runtime,
            registry: &*c.registry,
            ledger: &*c.ledger,
            clock: &*c.clock,
            backups: &backups,
        };
        let outcome = manager.rollback(environment, plan);
        ctx.evidence_json(EvidenceRole::Rollback, "outcome.json", &outcome);
        match &outcome {
            RollbackOutcome::RolledBack { version, .. } => {
                if ctx.release.is_none() {
                    ctx.release = Some(version.clone());
                }
                ctx.pass(outcome.summary());
                if let Err(f) = ctx.advance() {
                    ctx.fail(f);
                }
            }
            RollbackOutcome::Failed { .. } => {
                ctx.fail(StageFailure::new(
                    PipelineState::RollingBack,
                    FailureKind::RollbackFailure,
                    outcome.summary(),
                ));
            }
        }
        ctx.rollback = Some(outcome);
    }
}

/// Per-invocation bookkeeping: state trail, ledger stage entries, evidence
/// files and held environment locks.
struct RunCtx<'a> {
    ledger: &'a dyn Ledger,
    artifacts: &'a dyn ArtifactStore,
    clock: &'a dyn Clock,
    cancel: &'a CancelToken,
    holder: String,
    run_id: RunId,
    command: &'static str,
    run_dir: Option<PathBuf>,
    evidence: EvidenceManifest,
    /// Evidence files written since the last recorded stage.
    pending: Vec<String>,
    trail: StateTrail,
    locks: Vec<HeldLock>,
    release: Option<String>,
    failure: Option<StageFailure>,
    trigger: Option<StageFailure>,
    rollback: Option<RollbackOutcome>,
}

struct HeldLock {
    environment: String,
    id: LockId,
    ttl_secs: i64,
}

impl<'a> RunCtx<'a> {
    /// Move to the next stage. Every held lock is renewed first; a lock that
    /// expired mid-stage fails the run. Cancellation is honoured on entry to
    /// any stage up to and including Deploying.
    fn advance(&mut self) -> StageResult<PipelineState> {
        let from = self.trail.current;
        self.renew_locks()?;
        let next = self
            .trail
            .apply(StageEvent::Succeeded)
            .map_err(|e| StageFailure::new(from, FailureKind::Precondition, e.to_string()))?;
        tracing::info!(run_id = %self.run_id, stage = %next, "entering stage");
        if self.cancel.is_cancelled() && (next.precedes_deploy() || next == PipelineState::Deploying) {
            return Err(StageFailure::new(next, FailureKind::Cancelled, format!("cancelled by operator before {next}")));
        }
        Ok(next)
    }

    fn pass(&mut self, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::info!(run_id = %self.run_id, stage = %self.trail.current, detail = %detail, "stage passed");
        self.record(StageStatus::Pass, Some(detail));
    }

    fn skip(&mut self, detail: &str) {
        self.record(StageStatus::Skipped, Some(detail.to_string()));
    }

    /// Record `failure` against the current stage and take the failure transition.
    fn fail(&mut self, failure: StageFailure) -> PipelineState {
        let at = self.trail.current;
        tracing::error!(
            run_id = %self.run_id,
            stage = %at,
            kind = %failure.kind,
            live_touched = failure.live_touched,
            detail = %failure.detail,
            "stage failed"
        );
        self.record(StageStatus::Fail, Some(format!("{}: {}", failure.kind, failure.detail)));
        let event = StageEvent::Failed { kind: failure.kind, live_touched: failure.live_touched };
        let next = match self.trail.apply(event) {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(error = %e, "forcing failed state");
                self.trail.current = PipelineState::Failed;
                self.trail.visited.push(PipelineState::Failed);
                PipelineState::Failed
            }
        };
        self.failure = Some(failure);
        next
    }

    fn record(&mut self, status: StageStatus, detail: Option<String>) {
        let state = self.trail.current;
        let entry = StageEntry {
            run_id: self.run_id.clone(),
            command: self.command.to_string(),
            state,
            status,
            detail: detail.clone(),
            recorded_at: self.clock.now(),
        };
        if let Err(e) = self.ledger.record_stage(&entry) {
            tracing::warn!(error = %format!("{e:#}"), "could not record stage in ledger");
        }
        let line = match &detail {
            Some(d) => format!("- {state}: {} ({d})", status.as_str()),
            None => format!("- {state}: {}", status.as_str()),
        };
        self.evidence.stages.push(StageRecord {
            stage: state.to_string(),
            status: status.as_str().to_string(),
            detail,
            artifacts: std::mem::take(&mut self.pending),
        });
        self.worklog(&line);
        self.flush_manifest();
    }

    fn renew_locks(&self) -> StageResult<()> {
        let stage = self.trail.current;
        let now = self.clock.now();
        for held in &self.locks {
            let renewed = self
                .ledger
                .renew_lock(&held.environment, &held.id, held.ttl_secs, now)
                .stage_err(stage, FailureKind::Precondition)?;
            if !renewed {
                tracing::error!(environment = %held.environment, lock = %held.id, stage = %stage, "environment lock lost");
                return Err(StageFailure::new(
                    stage,
                    FailureKind::Precondition,
                    format!("lock on {} expired during {stage}; another run may hold it", held.environment),
                ));
            }
        }
        Ok(())
    }

    fn lock(&mut self, environment: &str, ttl_secs: i64) -> StageResult<()> {
        let stage = self.trail.current;
        let now = self.clock.now();
        let acquired = self
            .ledger
            .try_acquire_lock(environment, &self.holder, ttl_secs, now)
            .stage_err(stage, FailureKind::Precondition)?;
        match acquired {
            Some(id) => {
                tracing::debug!(environment, lock = %id, "environment locked");
                self.locks.push(HeldLock { environment: environment.to_string(), id, ttl_secs });
                self.evidence.environment = Some(environment.to_string());
                Ok(())
            }
            None => {
                let held_by = match self.ledger.current_lock(environment, now) {
                    Ok(Some(l)) => format!(" by {} until {}", l.holder, l.expires_at.to_rfc3339()),
                    _ => String::new(),
                };
                Err(StageFailure::new(
                    stage,
                    FailureKind::Precondition,
                    format!("{environment} is locked{held_by}"),
                ))
            }
        }
    }

    fn evidence_json<T: Serialize>(&mut self, role: EvidenceRole, name: &str, value: &T) {
        let Some(dir) = &self.run_dir else { return };
        let written = serde_json::to_vec_pretty(value)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| self.artifacts.write_role_bytes(dir, role, name, &bytes));
        match written {
            Ok(_) => self.pending.push(name.to_string()),
            Err(e) => tracing::warn!(name, error = %format!("{e:#}"), "could not write evidence"),
        }
    }

    fn worklog(&self, line: &str) {
        if let Some(dir) = &self.run_dir {
            if let Err(e) = self.artifacts.append_worklog(dir, line) {
                tracing::warn!(error = %format!("{e:#}"), "could not append worklog");
            }
        }
    }

    fn flush_manifest(&mut self) {
        self.evidence.release = self.release.clone();
        if let Some(dir) = &self.run_dir {
            if let Err(e) = self.artifacts.write_manifest(dir, &self.evidence) {
                tracing::warn!(error = %format!("{e:#}"), "could not write evidence manifest");
            }
        }
    }

    fn finish(mut self, result: StageResult<()>) -> PipelineReport {
        if let Err(failure) = result {
            self.fail(failure);
        }
        self.into_report()
    }

    fn into_report(mut self) -> PipelineReport {
        for held in std::mem::take(&mut self.locks) {
            if let Err(e) = self.ledger.release_lock(&held.environment, &held.id) {
                tracing::warn!(environment = %held.environment, error = %format!("{e:#}"), "could not release lock");
            }
        }
        self.evidence.final_state = Some(self.trail.current.to_string());
        self.flush_manifest();

        let report = PipelineReport {
            run_id: self.run_id.clone(),
            command: self.command.to_string(),
            trail: self.trail.clone(),
            release: self.release.clone(),
            failure: self.failure.clone(),
            trigger: self.trigger.clone(),
            rollback: self.rollback.clone(),
        };
        let code = report.exit_code();
        self.worklog(&format!("final: {} (exit {code})", self.trail.current));
        tracing::info!(run_id = %self.run_id, state = %self.trail.current, exit = code, "pipeline run finished");
        report
    }
}
