//! In-memory collaborators for pipeline tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rpl_artifacts::{encode_provenance, FsArtifactStore, PROVENANCE_LABEL};
use rpl_core::{Component, ProvenanceRecord, TestId};
use rpl_storage::InMemoryLedger;
use rpl_vcs::FakeSource;

use crate::pipeline::Collaborators;
use crate::traits::{
    ArtifactRegistry, BuildRequest, Clock, ContainerRuntime, HealthProbe, MigrationRunner, StoreBackup, TestExecutor,
};

fn guard<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| anyhow!("fake lock poisoned"))
}

#[derive(Clone, Debug)]
struct FakeImage {
    component: Component,
    labels: BTreeMap<String, String>,
    payload: Vec<(String, Vec<u8>)>,
    no_cache: bool,
}

#[derive(Default)]
struct RuntimeInner {
    images: BTreeMap<String, FakeImage>,
    registry: BTreeMap<String, FakeImage>,
    payloads: BTreeMap<Component, Vec<(String, Vec<u8>)>>,
    running: BTreeMap<Component, String>,
    unhealthy: BTreeSet<String>,
    failing_builds: BTreeSet<Component>,
    stale_labels: BTreeMap<Component, BTreeMap<String, String>>,
    failing_starts: BTreeSet<String>,
    fail_push: bool,
    events: Vec<String>,
}

/// Container runtime and registry in one, so published images keep their labels.
#[derive(Default)]
pub struct FakeRuntime {
    inner: Mutex<RuntimeInner>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut RuntimeInner) -> R) -> R {
        match self.inner.lock() {
            Ok(mut g) => f(&mut g),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn fail_build(&self, component: Component) {
        self.with(|i| i.failing_builds.insert(component));
    }

    /// Builds of `component` come out with `labels` from an earlier build,
    /// as a stale layer cache would produce.
    pub fn serve_stale(&self, component: Component, labels: &[(&str, &str)]) {
        let labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.with(|i| i.stale_labels.insert(component, labels));
    }

    pub fn fail_start(&self, image_ref: &str) {
        self.with(|i| i.failing_starts.insert(image_ref.to_string()));
    }

    pub fn fail_push(&self) {
        self.with(|i| i.fail_push = true);
    }

    /// Containers started from `image_ref` report unhealthy.
    pub fn mark_unhealthy(&self, image_ref: &str) {
        self.with(|i| i.unhealthy.insert(image_ref.to_string()));
    }

    pub fn set_payload(&self, component: Component, files: &[(&str, &str)]) {
        let files = files.iter().map(|(p, c)| (p.to_string(), c.as_bytes().to_vec())).collect();
        self.with(|i| i.payloads.insert(component, files));
    }

    /// Replace (or with `None` remove) a label on a local image.
    pub fn set_label(&self, image_ref: &str, key: &str, value: Option<&str>) {
        self.with(|i| {
            if let Some(img) = i.images.get_mut(image_ref) {
                match value {
                    Some(v) => img.labels.insert(key.to_string(), v.to_string()),
                    None => img.labels.remove(key),
                };
            }
        });
    }

    /// Same as `set_label` for an image already in the registry.
    pub fn set_registry_label(&self, coordinates: &str, key: &str, value: Option<&str>) {
        self.with(|i| {
            if let Some(img) = i.registry.get_mut(coordinates) {
                match value {
                    Some(v) => img.labels.insert(key.to_string(), v.to_string()),
                    None => img.labels.remove(key),
                };
            }
        });
    }

    /// Put an image straight into the registry, as if published by an earlier run.
    pub fn seed_published(&self, coordinates: &str, component: Component, provenance: Option<&ProvenanceRecord>) -> Result<()> {
        let mut labels = BTreeMap::new();
        if let Some(p) = provenance {
            labels.insert(PROVENANCE_LABEL.to_string(), encode_provenance(p)?);
        }
        self.with(|i| {
            i.registry.insert(
                coordinates.to_string(),
                FakeImage { component, labels, payload: vec![], no_cache: false },
            )
        });
        Ok(())
    }

    pub fn set_running(&self, component: Component, image_ref: &str) {
        self.with(|i| i.running.insert(component, image_ref.to_string()));
    }

    pub fn running(&self) -> BTreeMap<Component, String> {
        self.with(|i| i.running.clone())
    }

    pub fn built_no_cache(&self, image_ref: &str) -> bool {
        self.with(|i| i.images.get(image_ref).map(|img| img.no_cache).unwrap_or(false))
    }

    pub fn is_published(&self, coordinates: &str) -> bool {
        self.with(|i| i.registry.contains_key(coordinates))
    }

    pub fn events(&self) -> Vec<String> {
        self.with(|i| i.events.clone())
    }
}

impl ContainerRuntime for FakeRuntime {
    fn build(&self, request: &BuildRequest) -> Result<()> {
        self.with(|i| {
            i.events.push(format!("build {}", request.image_ref));
            if i.failing_builds.contains(&request.component) {
                return Err(anyhow!("build of {} exited with status 1", request.component));
            }
            let payload = i.payloads.get(&request.component).cloned().unwrap_or_default();
            let labels = i
                .stale_labels
                .get(&request.component)
                .cloned()
                .unwrap_or_else(|| request.labels.clone());
            i.images.insert(
                request.image_ref.clone(),
                FakeImage {
                    component: request.component.clone(),
                    labels,
                    payload,
                    no_cache: request.no_cache,
                },
            );
            Ok(())
        })
    }

    fn read_label(&self, image_ref: &str, key: &str) -> Result<Option<String>> {
        self.with(|i| {
            let img = i.images.get(image_ref).ok_or_else(|| anyhow!("no such image: {image_ref}"))?;
            Ok(img.labels.get(key).cloned())
        })
    }

    fn export_payload(&self, image_ref: &str, _payload_path: &str, dest: &Path) -> Result<()> {
        let files = self.with(|i| {
            i.images
                .get(image_ref)
                .map(|img| img.payload.clone())
                .ok_or_else(|| anyhow!("no such image: {image_ref}"))
        })?;
        for (rel, bytes) in files {
            let path = dest.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
        }
        Ok(())
    }

    fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.with(|i| {
            let img = i.images.get(source).cloned().ok_or_else(|| anyhow!("no such image: {source}"))?;
            i.images.insert(target.to_string(), img);
            i.events.push(format!("tag {source} {target}"));
            Ok(())
        })
    }

    fn stop(&self, component: &Component) -> Result<()> {
        self.with(|i| {
            i.running.remove(component);
            i.events.push(format!("stop {component}"));
        });
        Ok(())
    }

    fn start(&self, component: &Component, image_ref: &str) -> Result<()> {
        self.with(|i| {
            i.events.push(format!("start {component} {image_ref}"));
            if i.failing_starts.contains(image_ref) {
                return Err(anyhow!("container {component} exited immediately"));
            }
            let img = i.images.get(image_ref).ok_or_else(|| anyhow!("no such image: {image_ref}"))?;
            if &img.component != component {
                return Err(anyhow!("{image_ref} is not a {component} image"));
            }
            i.running.insert(component.clone(), image_ref.to_string());
            Ok(())
        })
    }

    fn running_images(&self) -> Result<BTreeMap<Component, String>> {
        Ok(self.running())
    }

    fn container_healthy(&self, component: &Component) -> Result<bool> {
        Ok(self.with(|i| match i.running.get(component) {
            Some(image) => !i.unhealthy.contains(image),
            None => false,
        }))
    }
}

impl ArtifactRegistry for FakeRuntime {
    fn push(&self, coordinates: &str) -> Result<()> {
        self.with(|i| {
            if i.fail_push {
                return Err(anyhow!("registry rejected {coordinates}: unauthorized"));
            }
            let img = i
                .images
                .get(coordinates)
                .cloned()
                .ok_or_else(|| anyhow!("no such image: {coordinates}"))?;
            i.registry.insert(coordinates.to_string(), img);
            i.events.push(format!("push {coordinates}"));
            Ok(())
        })
    }

    fn pull(&self, coordinates: &str) -> Result<()> {
        self.with(|i| {
            let img = i
                .registry
                .get(coordinates)
                .cloned()
                .ok_or_else(|| anyhow!("manifest for {coordinates} not found"))?;
            i.images.insert(coordinates.to_string(), img);
            i.events.push(format!("pull {coordinates}"));
            Ok(())
        })
    }
}

#[derive(Default)]
struct StoreInner {
    contents: BTreeMap<String, String>,
    fail_dump: bool,
    fail_restore: bool,
    fail_migrate: bool,
    migrations: Vec<String>,
    restores: Vec<String>,
}

/// Persistent store whose state is a string per environment. Migrations
/// append a marker so tests can see whether a restore undid them.
#[derive(Default)]
pub struct FakeStore {
    inner: Mutex<StoreInner>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_contents(&self, environment: &str, contents: &str) -> Result<()> {
        guard(&self.inner)?.contents.insert(environment.to_string(), contents.to_string());
        Ok(())
    }

    pub fn contents(&self, environment: &str) -> Result<String> {
        Ok(guard(&self.inner)?.contents.get(environment).cloned().unwrap_or_default())
    }

    pub fn fail_dump(&self) -> Result<()> {
        guard(&self.inner)?.fail_dump = true;
        Ok(())
    }

    pub fn fail_restore(&self) -> Result<()> {
        guard(&self.inner)?.fail_restore = true;
        Ok(())
    }

    pub fn fail_migrate(&self) -> Result<()> {
        guard(&self.inner)?.fail_migrate = true;
        Ok(())
    }

    pub fn migrations(&self) -> Result<Vec<String>> {
        Ok(guard(&self.inner)?.migrations.clone())
    }

    pub fn restores(&self) -> Result<Vec<String>> {
        Ok(guard(&self.inner)?.restores.clone())
    }
}

impl StoreBackup for FakeStore {
    fn dump(&self, environment: &str, dest: &Path) -> Result<()> {
        let inner = guard(&self.inner)?;
        if inner.fail_dump {
            return Err(anyhow!("dump of {environment} failed: disk full"));
        }
        let data = inner.contents.get(environment).cloned().unwrap_or_default();
        std::fs::write(dest, data).with_context(|| format!("write {}", dest.display()))?;
        Ok(())
    }

    fn restore(&self, environment: &str, src: &Path) -> Result<()> {
        let mut inner = guard(&self.inner)?;
        if inner.fail_restore {
            return Err(anyhow!("restore of {environment} failed"));
        }
        let data = std::fs::read_to_string(src).with_context(|| format!("read {}", src.display()))?;
        inner.contents.insert(environment.to_string(), data);
        inner.restores.push(environment.to_string());
        Ok(())
    }
}

impl MigrationRunner for FakeStore {
    fn migrate(&self, environment: &str) -> Result<()> {
        let mut inner = guard(&self.inner)?;
        if inner.fail_migrate {
            return Err(anyhow!("migration 0042 failed on {environment}"));
        }
        inner.contents.entry(environment.to_string()).or_default().push_str("+migrated");
        inner.migrations.push(environment.to_string());
        Ok(())
    }
}

/// Scripted probe. Without a script for a component it follows the
/// container health reported by `runtime`, or reports healthy.
#[derive(Default)]
pub struct FakeProbe {
    script: Mutex<BTreeMap<Component, VecDeque<Option<bool>>>>,
    runtime: Option<Arc<FakeRuntime>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn following(runtime: Arc<FakeRuntime>) -> Self {
        Self { script: Mutex::default(), runtime: Some(runtime) }
    }

    /// Queue observations; `None` makes that probe return an error.
    pub fn script(&self, component: Component, steps: &[Option<bool>]) -> Result<()> {
        guard(&self.script)?.entry(component).or_default().extend(steps.iter().copied());
        Ok(())
    }
}

impl HealthProbe for FakeProbe {
    fn probe(&self, component: &Component) -> Result<bool> {
        let step = guard(&self.script)?.get_mut(component).and_then(|q| q.pop_front());
        match step {
            Some(Some(healthy)) => Ok(healthy),
            Some(None) => Err(anyhow!("connection refused")),
            None => match &self.runtime {
                Some(rt) => rt.container_healthy(component),
                None => Ok(true),
            },
        }
    }
}

/// Test executor with per-test failure budgets.
#[derive(Default)]
pub struct FakeTestExecutor {
    budget: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<(TestId, u8)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Duration,
}

impl FakeTestExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each test call sleeps for `delay`, so concurrent calls overlap.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay, ..Self::default() }
    }

    /// `test` fails its next `failures` runs, then passes.
    pub fn flaky(&self, test: &str, failures: u32) -> Result<()> {
        guard(&self.budget)?.insert(test.to_string(), failures);
        Ok(())
    }

    pub fn broken(&self, test: &str) -> Result<()> {
        self.flaky(test, u32::MAX)
    }

    pub fn calls(&self) -> Result<Vec<(TestId, u8)>> {
        Ok(guard(&self.calls)?.clone())
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl TestExecutor for FakeTestExecutor {
    fn run_test(&self, test: &TestId, tier: u8) -> Result<bool> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let passed = {
            let mut budget = guard(&self.budget)?;
            match budget.get_mut(test.as_str()) {
                Some(left) if *left > 0 => {
                    *left = left.saturating_sub(1);
                    false
                }
                _ => true,
            }
        };
        guard(&self.calls)?.push((test.clone(), tier));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(passed)
    }
}

/// Clock that only moves when slept on.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        match self.now.lock() {
            Ok(mut g) => *g += by,
            Err(poisoned) => *poisoned.into_inner() += by,
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Every collaborator faked, wired to share state where the real ones would.
pub struct FakeWorld {
    pub source: Arc<FakeSource>,
    pub runtime: Arc<FakeRuntime>,
    pub store: Arc<FakeStore>,
    pub probe: Arc<FakeProbe>,
    pub tests: Arc<FakeTestExecutor>,
    pub clock: Arc<ManualClock>,
    pub ledger: Arc<InMemoryLedger>,
    pub artifacts: Arc<FsArtifactStore>,
    pub backup_root: PathBuf,
}

impl FakeWorld {
    /// `root` holds the artifact store and backup files.
    pub fn new(root: &Path, start: DateTime<Utc>) -> Self {
        let runtime = Arc::new(FakeRuntime::new());
        Self {
            source: Arc::new(FakeSource::new()),
            probe: Arc::new(FakeProbe::following(runtime.clone())),
            runtime,
            store: Arc::new(FakeStore::new()),
            tests: Arc::new(FakeTestExecutor::new()),
            clock: Arc::new(ManualClock::new(start)),
            ledger: Arc::new(InMemoryLedger::new()),
            artifacts: Arc::new(FsArtifactStore::new(root.join("artifacts"))),
            backup_root: root.join("backups"),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            source: self.source.clone(),
            runtime: self.runtime.clone(),
            registry: self.runtime.clone(),
            backup: self.store.clone(),
            migrations: self.store.clone(),
            probe: self.probe.clone(),
            tests: self.tests.clone(),
            clock: self.clock.clone(),
            ledger: self.ledger.clone(),
            artifacts: self.artifacts.clone(),
            backup_root: self.backup_root.clone(),
        }
    }
}
