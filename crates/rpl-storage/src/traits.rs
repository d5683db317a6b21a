use chrono::{DateTime, Utc};
use rpl_core::{BackupId, BackupSnapshot, DeploymentRecord, LockId, PipelineState, RunId, StageStatus};
use serde::{Deserialize, Serialize};

/// One stage transition of a pipeline invocation, kept for `status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEntry {
    pub run_id: RunId,
    pub command: String,
    pub state: PipelineState,
    pub status: StageStatus,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvLock {
    pub id: LockId,
    pub environment: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Durable record of what was deployed where, which backups exist, and who
/// currently owns an environment.
///
/// Deployment history is append-only: records are never edited or removed.
pub trait Ledger: Send + Sync {
    fn append_deployment(&self, record: &DeploymentRecord) -> anyhow::Result<()>;
    /// Oldest first.
    fn deployments(&self, environment: &str) -> anyhow::Result<Vec<DeploymentRecord>>;
    fn active_deployment(&self, environment: &str) -> anyhow::Result<Option<DeploymentRecord>> {
        Ok(self.deployments(environment)?.pop())
    }

    fn record_backup(&self, snapshot: &BackupSnapshot) -> anyhow::Result<()>;
    /// Oldest first.
    fn backups(&self, environment: &str) -> anyhow::Result<Vec<BackupSnapshot>>;
    fn delete_backup(&self, id: &BackupId) -> anyhow::Result<()>;

    /// Take the exclusive lock on `environment`. Expired locks are reclaimed.
    /// Returns `None` while another holder owns a live lock.
    fn try_acquire_lock(
        &self,
        environment: &str,
        holder: &str,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<LockId>>;
    /// Push the expiry of a lock `id` still holds to `now + ttl_secs`.
    /// Returns `false` once the lock has expired or changed hands.
    fn renew_lock(&self, environment: &str, id: &LockId, ttl_secs: i64, now: DateTime<Utc>) -> anyhow::Result<bool>;
    fn release_lock(&self, environment: &str, id: &LockId) -> anyhow::Result<()>;
    fn current_lock(&self, environment: &str, now: DateTime<Utc>) -> anyhow::Result<Option<EnvLock>>;

    fn record_stage(&self, entry: &StageEntry) -> anyhow::Result<()>;
    /// Most recent first.
    fn recent_stages(&self, limit: usize) -> anyhow::Result<Vec<StageEntry>>;
}
