use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rpl_core::{Component, TestId};

#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub component: Component,
    pub context: PathBuf,
    pub dockerfile: Option<PathBuf>,
    pub image_ref: String,
    pub labels: BTreeMap<String, String>,
    pub no_cache: bool,
}

/// Builds images and drives the containers of one project.
pub trait ContainerRuntime: Send + Sync {
    fn build(&self, request: &BuildRequest) -> Result<()>;
    /// `None` when the image carries no such label.
    fn read_label(&self, image_ref: &str, key: &str) -> Result<Option<String>>;
    /// Copy `payload_path` out of the image into `dest`.
    fn export_payload(&self, image_ref: &str, payload_path: &str, dest: &Path) -> Result<()>;
    fn tag(&self, source: &str, target: &str) -> Result<()>;
    /// Stopping a component that is not running is not an error.
    fn stop(&self, component: &Component) -> Result<()>;
    fn start(&self, component: &Component, image_ref: &str) -> Result<()>;
    /// Image reference of every running component of the project.
    fn running_images(&self) -> Result<BTreeMap<Component, String>>;
    fn container_healthy(&self, component: &Component) -> Result<bool>;
}

pub trait ArtifactRegistry: Send + Sync {
    /// Overwrites an existing artifact at the same coordinates.
    fn push(&self, coordinates: &str) -> Result<()>;
    fn pull(&self, coordinates: &str) -> Result<()>;
}

/// Dumps and restores the persistent store of an environment.
pub trait StoreBackup: Send + Sync {
    fn dump(&self, environment: &str, dest: &Path) -> Result<()>;
    fn restore(&self, environment: &str, src: &Path) -> Result<()>;
}

pub trait MigrationRunner: Send + Sync {
    fn migrate(&self, environment: &str) -> Result<()>;
}

pub trait HealthProbe: Send + Sync {
    fn probe(&self, component: &Component) -> Result<bool>;
}

pub trait TestExecutor: Send + Sync {
    /// `Ok(false)` is a failed test; `Err` means the test could not be run.
    fn run_test(&self, test: &TestId, tier: u8) -> Result<bool>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
