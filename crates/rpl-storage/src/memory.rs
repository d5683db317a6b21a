use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use rpl_core::{BackupId, BackupSnapshot, DeploymentRecord, LockId};

use crate::traits::{EnvLock, Ledger, StageEntry};

/// In-memory ledger for tests and dry runs. Not durable.
#[derive(Default)]
pub struct InMemoryLedger {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    deployments: Vec<DeploymentRecord>,
    backups: Vec<BackupSnapshot>,
    locks: HashMap<String, EnvLock>,
    stages: Vec<StageEntry>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("in-memory ledger lock poisoned"))
    }
}

impl Ledger for InMemoryLedger {
    fn append_deployment(&self, record: &DeploymentRecord) -> anyhow::Result<()> {
        let mut inner = self.lock()?;
        if inner.deployments.iter().any(|d| d.id == record.id) {
            return Err(anyhow!("deployment {} already recorded", record.id));
        }
        inner.deployments.push(record.clone());
        Ok(())
    }

    fn deployments(&self, environment: &str) -> anyhow::Result<Vec<DeploymentRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .deployments
            .iter()
            .filter(|d| d.environment == environment)
            .cloned()
            .collect())
    }

    fn record_backup(&self, snapshot: &BackupSnapshot) -> anyhow::Result<()> {
        let mut inner = self.lock()?;
        inner.backups.push(snapshot.clone());
        Ok(())
    }

    fn backups(&self, environment: &str) -> anyhow::Result<Vec<BackupSnapshot>> {
        let inner = self.lock()?;
        Ok(inner.backups.iter().filter(|b| b.environment == environment).cloned().collect())
    }

    fn delete_backup(&self, id: &BackupId) -> anyhow::Result<()> {
        let mut inner = self.lock()?;
        inner.backups.retain(|b| &b.id != id);
        Ok(())
    }

    fn try_acquire_lock(
        &self,
        environment: &str,
        holder: &str,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<LockId>> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.locks.get(environment) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }
        let id = LockId::new();
        inner.locks.insert(
            environment.to_string(),
            EnvLock {
                id: id.clone(),
                environment: environment.to_string(),
                holder: holder.to_string(),
                acquired_at: now,
                expires_at: now + Duration::seconds(ttl_secs),
            },
        );
        Ok(Some(id))
    }

    fn renew_lock(&self, environment: &str, id: &LockId, ttl_secs: i64, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut inner = self.lock()?;
        match inner.locks.get_mut(environment) {
            Some(held) if &held.id == id && held.expires_at > now => {
                held.expires_at = now + Duration::seconds(ttl_secs);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release_lock(&self, environment: &str, id: &LockId) -> anyhow::Result<()> {
        let mut inner = self.lock()?;
        if inner.locks.get(environment).map(|l| &l.id == id).unwrap_or(false) {
            inner.locks.remove(environment);
        }
        Ok(())
    }

    fn current_lock(&self, environment: &str, now: DateTime<Utc>) -> anyhow::Result<Option<EnvLock>> {
        let inner = self.lock()?;
        Ok(inner.locks.get(environment).filter(|l| l.expires_at > now).cloned())
    }

    fn record_stage(&self, entry: &StageEntry) -> anyhow::Result<()> {
        let mut inner = self.lock()?;
        inner.stages.push(entry.clone());
        Ok(())
    }

    fn recent_stages(&self, limit: usize) -> anyhow::Result<Vec<StageEntry>> {
        let inner = self.lock()?;
        Ok(inner.stages.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpl_core::{DeploymentId, DeploymentKind, PipelineState, RunId, StageStatus};

    fn rec(env: &str, version: &str, previous: Option<&str>) -> DeploymentRecord {
        DeploymentRecord {
            id: DeploymentId::new(),
            environment: env.into(),
            version: version.into(),
            artifacts: vec![],
            deployed_at: Utc::now(),
            previous_version: previous.map(String::from),
            kind: DeploymentKind::Deploy,
            migrations_ran: false,
            backup_id: None,
        }
    }

    #[test]
    fn test_new_ledger_is_empty() {
        let ledger = InMemoryLedger::new();
        assert!(ledger.deployments("production").unwrap().is_empty());
        assert!(ledger.active_deployment("production").unwrap().is_none());
        assert!(ledger.backups("production").unwrap().is_empty());
    }

    #[test]
    fn test_deployments_are_per_environment_in_order() {
        let ledger = InMemoryLedger::new();
        ledger.append_deployment(&rec("production", "v1", None)).unwrap();
        ledger.append_deployment(&rec("staging", "s1", None)).unwrap();
        ledger.append_deployment(&rec("production", "v2", Some("v1"))).unwrap();
        let prod: Vec<String> = ledger.deployments("production").unwrap().into_iter().map(|d| d.version).collect();
        assert_eq!(prod, vec!["v1", "v2"]);
        assert_eq!(ledger.active_deployment("production").unwrap().unwrap().version, "v2");
    }

    #[test]
    fn test_duplicate_deployment_id_rejected() {
        let ledger = InMemoryLedger::new();
        let r = rec("production", "v1", None);
        ledger.append_deployment(&r).unwrap();
        assert!(ledger.append_deployment(&r).is_err());
    }

    #[test]
    fn test_lock_is_exclusive_until_expiry() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let id = ledger.try_acquire_lock("production", "a", 60, now).unwrap().unwrap();
        assert!(ledger.try_acquire_lock("production", "b", 60, now).unwrap().is_none());
        assert!(ledger.try_acquire_lock("staging", "b", 60, now).unwrap().is_some());
        assert_eq!(ledger.current_lock("production", now).unwrap().unwrap().holder, "a");

        let later = now + Duration::seconds(61);
        assert!(ledger.try_acquire_lock("production", "b", 60, later).unwrap().is_some());
        // stale id no longer owns the lock
        ledger.release_lock("production", &id).unwrap();
        assert_eq!(ledger.current_lock("production", later).unwrap().unwrap().holder, "b");
    }

    #[test]
    fn test_lock_renewal_needs_a_live_lock() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let id = ledger.try_acquire_lock("production", "a", 10, now).unwrap().unwrap();

        let soon = now + Duration::seconds(8);
        assert!(ledger.renew_lock("production", &id, 10, soon).unwrap());
        // renewed expiry is soon + 10
        let past_first_ttl = now + Duration::seconds(15);
        assert!(ledger.try_acquire_lock("production", "b", 10, past_first_ttl).unwrap().is_none());

        let expired = soon + Duration::seconds(10);
        assert!(!ledger.renew_lock("production", &id, 10, expired).unwrap());
        assert!(ledger.try_acquire_lock("production", "b", 10, expired).unwrap().is_some());
        assert!(!ledger.renew_lock("production", &id, 10, expired).unwrap());
        assert!(!ledger.renew_lock("staging", &id, 10, now).unwrap());
    }

    #[test]
    fn test_backup_delete() {
        let ledger = InMemoryLedger::new();
        let b = BackupSnapshot {
            id: BackupId::new(),
            environment: "production".into(),
            taken_at: Utc::now(),
            store_ref: "/tmp/b.dump".into(),
        };
        ledger.record_backup(&b).unwrap();
        assert_eq!(ledger.backups("production").unwrap().len(), 1);
        ledger.delete_backup(&b.id).unwrap();
        assert!(ledger.backups("production").unwrap().is_empty());
    }

    #[test]
    fn test_recent_stages_newest_first() {
        let ledger = InMemoryLedger::new();
        for state in [PipelineState::Building, PipelineState::Verifying] {
            ledger
                .record_stage(&StageEntry {
                    run_id: RunId::from_str("r"),
                    command: "build".into(),
                    state,
                    status: StageStatus::Pass,
                    detail: None,
                    recorded_at: Utc::now(),
                })
                .unwrap();
        }
        let recent = ledger.recent_stages(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].state, PipelineState::Verifying);
    }
}
