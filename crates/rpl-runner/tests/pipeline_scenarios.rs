use std::time::Duration;

use chrono::{DateTime, Utc};
use rpl_artifacts::{encode_provenance, ArtifactStore, PROVENANCE_LABEL};
use rpl_core::{
    Component, DeploymentKind, FailureKind, PipelineState, ProvenanceRecord, ReleaseVersion, RollbackOutcome,
    TestCategory,
};
use rpl_runner::fakes::FakeWorld;
use rpl_runner::{CancelToken, Config, DeployOptions, Pipeline, RollbackOptions, RunOptions, TestOptions};
use rpl_storage::Ledger;
use rpl_suite::{save_suite_manifest, SuiteEntry, SuiteManifest};
use tempfile::TempDir;

const C1: &str = "c1a55e5a1f00";
const C2: &str = "d2b66f6b2f00";

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn suite(n: usize, known_slow: &[&str]) -> SuiteManifest {
    SuiteManifest {
        suite: "shop".into(),
        tests: (0..n)
            .map(|i| SuiteEntry { id: format!("t{i:02}"), category: TestCategory::Integration })
            .collect(),
        known_slow: known_slow.iter().map(|s| s.to_string()).collect(),
    }
}

struct Harness {
    _dir: TempDir,
    world: FakeWorld,
    pipeline: Pipeline,
}

impl Harness {
    fn new(suite: SuiteManifest) -> Self {
        Self::with_config(suite, Config::default_for_repo("shop"))
    }

    fn with_config(suite: SuiteManifest, cfg: Config) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let world = FakeWorld::new(dir.path(), at("2026-02-05T16:36:00Z"));
        save_suite_manifest(&cfg.suite_path(dir.path()), &suite).unwrap();
        let pipeline = Pipeline::new(dir.path().to_path_buf(), cfg, world.collaborators(), CancelToken::new());
        Self { _dir: dir, world, pipeline }
    }

    fn commit(&self, id: &str, backend_blob: &str) {
        self.world
            .source
            .commit(id, &[("backend/app.py", backend_blob), ("frontend/index.html", "f1")])
            .unwrap();
    }

    /// Tag the next build of HEAD commit `commit` will get.
    fn next_tag(&self, commit: &str) -> String {
        use rpl_runner::Clock;
        ReleaseVersion::derive(commit, self.world.clock.now(), 7).unwrap().tag
    }

    fn coordinates(&self, tag: &str) -> Vec<String> {
        let cfg = &self.pipeline.cfg;
        vec![
            cfg.coordinates(&Component::Backend, tag),
            cfg.coordinates(&Component::Frontend, tag),
        ]
    }

    fn running_tags(&self) -> Vec<String> {
        self.world.runtime.running().into_values().collect()
    }
}

#[test]
fn test_build_tags_commit_with_build_time() {
    let h = Harness::new(suite(3, &[]));
    h.commit("abc123", "b1");
    let report = h.pipeline.build();
    assert!(report.succeeded(), "{}", report.summary());
    assert_eq!(report.release.as_deref(), Some("vabc123-20260205-163600"));
    assert_eq!(report.trail.current, PipelineState::Verifying);

    let release = h.world.artifacts.latest_release("shop").unwrap().unwrap();
    assert!(release.verified);
    assert_eq!(release.artifacts.len(), 2);

    // same commit, same second
    let again = h.pipeline.build();
    assert_eq!(again.release.as_deref(), Some("vabc123-20260205-163600-02"));
}

#[test]
fn test_provenance_mismatch_never_reaches_publish() {
    let h = Harness::new(suite(3, &[]));
    h.commit("f00df00d", "b1");
    let stale = encode_provenance(&ProvenanceRecord {
        git_commit: "badc0de".into(),
        build_date: at("2026-01-01T00:00:00Z"),
        source_hash: "00".into(),
    })
    .unwrap();
    h.world.runtime.serve_stale(Component::Backend, &[(PROVENANCE_LABEL, &stale)]);

    let report = h.pipeline.run(&RunOptions::default());
    assert_eq!(report.exit_code(), 11);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::ProvenanceMismatch);
    assert!(failure.detail.contains("badc0de"));
    assert!(!report.trail.visited.contains(&PipelineState::Publishing));
    assert!(!h.world.runtime.events().iter().any(|e| e.starts_with("push")));
    assert!(h.world.tests.calls().unwrap().is_empty());
}

#[test]
fn test_denied_marker_in_verified_payload_blocks_publish() {
    let mut cfg = Config::default_for_repo("shop");
    cfg.gate.deny = vec!["INTERNAL-ONLY".into()];
    let h = Harness::with_config(suite(5, &[]), cfg);
    h.commit(C1, "b1");
    h.world
        .runtime
        .set_payload(Component::Frontend, &[("index.html", "<p>INTERNAL-ONLY</p>"), ("app.js", "render()")]);

    let report = h.pipeline.run(&RunOptions::default());
    assert_eq!(report.exit_code(), 12, "{}", report.summary());
    assert_eq!(report.trail.current, PipelineState::Failed);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::ContentGateViolation);
    assert!(failure.detail.contains("index.html"), "{}", failure.detail);
    assert!(report.trail.visited.contains(&PipelineState::Gating));
    assert!(!report.trail.visited.contains(&PipelineState::Publishing));
    assert!(!h.world.runtime.events().iter().any(|e| e.starts_with("push")));

    let release = h.world.artifacts.latest_release("shop").unwrap().unwrap();
    assert!(release.verified);
    assert!(!release.gate.as_ref().unwrap().passed);
    assert!(!release.is_published());
    assert!(h.world.ledger.deployments("production").unwrap().is_empty());
}

#[test]
fn test_tiered_recovery_proceeds_to_gating() {
    let h = Harness::new(suite(50, &["t40", "t41"]));
    h.commit(C1, "b1");
    h.world.tests.flaky("t01", 1).unwrap();
    h.world.tests.flaky("t02", 1).unwrap();
    h.world.tests.flaky("t03", 2).unwrap();

    let report = h.pipeline.run(&RunOptions::default());
    assert!(report.succeeded(), "{}", report.summary());
    assert!(report.trail.visited.contains(&PipelineState::Gating));
    assert_eq!(report.trail.current, PipelineState::Done);

    let calls = h.world.tests.calls().unwrap();
    let tier = |n: u8| -> Vec<String> {
        let mut ids: Vec<String> = calls.iter().filter(|(_, t)| *t == n).map(|(id, _)| id.0.clone()).collect();
        ids.sort();
        ids
    };
    assert_eq!(tier(1).len(), 50);
    assert_eq!(tier(2), vec!["t01", "t02", "t03"]);
    assert_eq!(tier(3), vec!["t03", "t40", "t41"]);

    let release = h.world.artifacts.latest_release("shop").unwrap().unwrap();
    assert!(release.tests_passed());
    assert!(release.is_published());
}

#[test]
fn test_unhealthy_backend_rolls_back_to_previous_tags() {
    let h = Harness::new(suite(5, &[]));
    h.world.store.set_contents("production", "orders:1").unwrap();

    h.commit(C1, "b1");
    let v1 = h.next_tag(C1);
    let first = h.pipeline.run(&RunOptions::default());
    assert!(first.succeeded(), "{}", first.summary());

    h.world.clock.advance(Duration::from_secs(3600));
    h.commit(C2, "b2");
    let v2 = h.next_tag(C2);
    h.world
        .runtime
        .mark_unhealthy(&h.pipeline.cfg.coordinates(&Component::Backend, &v2));

    let report = h.pipeline.run(&RunOptions::default());
    assert_eq!(report.exit_code(), 20);
    assert!(report.summary().contains("rolled back"));
    assert_eq!(report.trigger.as_ref().unwrap().kind, FailureKind::HealthCheckFailure);
    assert_eq!(report.trail.current, PipelineState::RolledBack);
    assert_eq!(
        report.rollback,
        Some(RollbackOutcome::RolledBack { version: v1.clone(), restored_backup: true })
    );

    let mut expected = h.coordinates(&v1);
    expected.sort();
    let mut running = h.running_tags();
    running.sort();
    assert_eq!(running, expected);

    let history = h.world.ledger.deployments("production").unwrap();
    let kinds: Vec<(DeploymentKind, &str)> = history.iter().map(|r| (r.kind, r.version.as_str())).collect();
    assert_eq!(
        kinds,
        vec![
            (DeploymentKind::Deploy, v1.as_str()),
            (DeploymentKind::Deploy, v2.as_str()),
            (DeploymentKind::Rollback, v1.as_str()),
        ]
    );
    // store is back to the pre-deploy snapshot of v2
    assert_eq!(h.world.store.contents("production").unwrap(), "orders:1+migrated");
}

#[test]
fn test_explicit_rollback_needs_no_build() {
    let h = Harness::new(suite(5, &[]));
    h.commit(C1, "b1");
    let v1 = h.next_tag(C1);
    assert!(h.pipeline.run(&RunOptions::default()).succeeded());
    h.world.clock.advance(Duration::from_secs(60));
    h.commit(C2, "b2");
    assert!(h.pipeline.run(&RunOptions::default()).succeeded());

    let before = h.world.runtime.events().len();
    let report = h.pipeline.rollback(&RollbackOptions::default());
    assert_eq!(report.exit_code(), 0, "{}", report.summary());
    assert_eq!(report.trail.current, PipelineState::RolledBack);

    let events = h.world.runtime.events();
    assert!(!events[before..].iter().any(|e| e.starts_with("build")));
    let mut running = h.running_tags();
    running.sort();
    let mut expected = h.coordinates(&v1);
    expected.sort();
    assert_eq!(running, expected);

    let active = h.world.ledger.active_deployment("production").unwrap().unwrap();
    assert_eq!(active.kind, DeploymentKind::Rollback);
    assert_eq!(active.version, v1);
}

#[test]
fn test_rollback_with_nothing_to_roll_back_to_fails() {
    let h = Harness::new(suite(5, &[]));
    h.commit(C1, "b1");
    assert!(h.pipeline.run(&RunOptions::default()).succeeded());
    let report = h.pipeline.rollback(&RollbackOptions::default());
    assert_eq!(report.exit_code(), 21);
    assert_eq!(report.failure.unwrap().kind, FailureKind::RollbackFailure);
}

#[test]
fn test_migration_failure_does_not_roll_back() {
    let h = Harness::new(suite(5, &[]));
    h.commit(C1, "b1");
    let v1 = h.next_tag(C1);
    assert!(h.pipeline.run(&RunOptions::default()).succeeded());

    h.world.clock.advance(Duration::from_secs(60));
    h.commit(C2, "b2");
    h.world.store.fail_migrate().unwrap();
    let report = h.pipeline.run(&RunOptions::default());
    assert_eq!(report.exit_code(), 16, "{}", report.summary());
    assert_eq!(report.trail.current, PipelineState::Failed);
    assert!(report.rollback.is_none());

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::MigrationFailure);
    let backup = h
        .world
        .ledger
        .backups("production")
        .unwrap()
        .into_iter()
        .max_by_key(|b| b.taken_at)
        .unwrap();
    assert!(failure.detail.contains(&format!("backup {} preserved", backup.id)), "{}", failure.detail);
    assert!(failure.detail.contains("manual intervention required"));
    assert!(report.summary().contains("manual intervention required"));

    // the superseded release is what serves traffic, and the ledger agrees
    let mut running = h.running_tags();
    running.sort();
    assert_eq!(running, h.coordinates(&v1));
    let history = h.world.ledger.deployments("production").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(h.world.ledger.active_deployment("production").unwrap().unwrap().version, v1);
    assert!(h.world.store.restores().unwrap().is_empty());
}

#[test]
fn test_first_deploy_migration_failure_leaves_nothing_running() {
    let h = Harness::new(suite(5, &[]));
    h.commit(C1, "b1");
    h.world.store.fail_migrate().unwrap();
    let report = h.pipeline.run(&RunOptions::default());
    assert_eq!(report.exit_code(), 16);
    assert_eq!(report.trail.current, PipelineState::Failed);
    assert!(report.rollback.is_none());
    assert!(report.failure.as_ref().unwrap().detail.contains("running: nothing"));
    assert!(h.running_tags().is_empty());
    assert!(h.world.ledger.deployments("production").unwrap().is_empty());
}

#[test]
fn test_lock_expiring_mid_run_fails_the_run() {
    let mut cfg = Config::default_for_repo("shop");
    cfg.deploy.lock_ttl_secs = 10;
    let h = Harness::with_config(suite(5, &[]), cfg);
    h.commit(C1, "b1");
    // three unhealthy rounds at 5s apart outlast the 10s lock
    h.world
        .probe
        .script(Component::Backend, &[Some(false), Some(false), Some(false)])
        .unwrap();

    let report = h.pipeline.run(&RunOptions::default());
    assert_eq!(report.exit_code(), 2, "{}", report.summary());
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::Precondition);
    assert_eq!(failure.stage, PipelineState::HealthChecking);
    assert!(failure.detail.contains("lock on production expired"), "{}", failure.detail);
    assert!(!report.trail.visited.contains(&PipelineState::Done));

    use rpl_runner::Clock;
    let now = h.world.clock.now();
    assert!(h.world.ledger.current_lock("production", now).unwrap().is_none());
}

#[test]
fn test_lock_outliving_health_polling_lets_the_run_finish() {
    let mut cfg = Config::default_for_repo("shop");
    cfg.deploy.lock_ttl_secs = 10;
    let h = Harness::with_config(suite(5, &[]), cfg);
    h.commit(C1, "b1");
    h.world.probe.script(Component::Backend, &[Some(false)]).unwrap();

    let report = h.pipeline.run(&RunOptions::default());
    assert!(report.succeeded(), "{}", report.summary());
    assert_eq!(report.trail.current, PipelineState::Done);
    use rpl_runner::Clock;
    let now = h.world.clock.now();
    assert!(h.world.ledger.current_lock("production", now).unwrap().is_none());
}

#[test]
fn test_failed_start_reactivates_current_release() {
    let h = Harness::new(suite(5, &[]));
    h.commit(C1, "b1");
    let v1 = h.next_tag(C1);
    assert!(h.pipeline.run(&RunOptions::default()).succeeded());

    h.world.clock.advance(Duration::from_secs(60));
    h.commit(C2, "b2");
    let v2 = h.next_tag(C2);
    h.world
        .runtime
        .fail_start(&h.pipeline.cfg.coordinates(&Component::Frontend, &v2));

    let report = h.pipeline.run(&RunOptions { skip_migrations: true, ..RunOptions::default() });
    assert_eq!(report.exit_code(), 20, "{}", report.summary());
    assert_eq!(report.trigger.as_ref().unwrap().kind, FailureKind::DeployFailure);
    let history = h.world.ledger.deployments("production").unwrap();
    assert_eq!(history.len(), 1);
    let mut running = h.running_tags();
    running.sort();
    let mut expected = h.coordinates(&v1);
    expected.sort();
    assert_eq!(running, expected);
}

#[test]
fn test_deploy_refuses_unpublished_release() {
    let h = Harness::new(suite(5, &[]));
    h.commit(C1, "b1");
    let built = h.pipeline.build();
    let tag = built.release.clone().unwrap();
    assert!(h.pipeline.test(&TestOptions::default()).succeeded());

    let report = h.pipeline.deploy(&DeployOptions { version: tag, ..DeployOptions::default() });
    assert_eq!(report.exit_code(), 2);
    assert!(report.failure.unwrap().detail.contains("never published"));
    assert!(h.running_tags().is_empty());
    assert!(h.world.ledger.backups("production").unwrap().is_empty());
}

#[test]
fn test_separate_commands_chain_through_release_manifest() {
    let h = Harness::new(suite(5, &[]));
    h.commit(C1, "b1");
    let tag = h.pipeline.build().release.unwrap();

    // gate before tests is refused
    assert_eq!(h.pipeline.push(Some(&tag)).exit_code(), 2);
    assert!(h.pipeline.test(&TestOptions { release: Some(tag.clone()), ..TestOptions::default() }).succeeded());
    assert!(h.pipeline.push(Some(&tag)).succeeded());

    let report = h.pipeline.deploy(&DeployOptions { version: tag.clone(), ..DeployOptions::default() });
    assert!(report.succeeded(), "{}", report.summary());
    assert_eq!(h.pipeline.history(None).unwrap().len(), 1);
    assert_eq!(h.pipeline.backup_list(None).unwrap().len(), 1);
    let status = h.pipeline.status().unwrap();
    assert_eq!(status.active.unwrap().version, tag);
    assert!(status.lock.is_none());
}

#[test]
fn test_load_prod_data_needs_a_production_backup() {
    let h = Harness::new(suite(5, &[]));
    h.commit(C1, "b1");
    assert!(h.pipeline.build().succeeded());
    let opts = TestOptions { load_prod_data: true, ..TestOptions::default() };
    assert_eq!(h.pipeline.test(&opts).exit_code(), 2);

    h.world.store.set_contents("production", "orders:7").unwrap();
    assert!(h.pipeline.run(&RunOptions::default()).succeeded());
    assert!(h.pipeline.test(&opts).succeeded());
    assert_eq!(h.world.store.contents("test").unwrap(), "orders:7");
}

#[test]
fn test_failing_suite_stops_before_gating() {
    let h = Harness::new(suite(5, &[]));
    h.commit(C1, "b1");
    h.world.tests.broken("t02").unwrap();
    let report = h.pipeline.run(&RunOptions::default());
    assert_eq!(report.exit_code(), 13);
    assert!(report.failure.unwrap().detail.contains("integration: t02"));
    assert!(!report.trail.visited.contains(&PipelineState::Gating));
}
