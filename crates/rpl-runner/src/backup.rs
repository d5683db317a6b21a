use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rpl_core::{BackupId, BackupSnapshot, FailureKind, PipelineState, StageResult};
use rpl_storage::Ledger;

use crate::stage::StageContext;
use crate::traits::{Clock, StoreBackup};

/// Point-in-time store snapshots, one file each under `root/<env>/`.
pub struct BackupManager<'a> {
    pub backup: &'a dyn StoreBackup,
    pub ledger: &'a dyn Ledger,
    pub clock: &'a dyn Clock,
    pub root: &'a Path,
}

impl<'a> BackupManager<'a> {
    pub fn take(&self, environment: &str) -> StageResult<BackupSnapshot> {
        self.take_inner(environment)
            .stage_err(PipelineState::BackingUp, FailureKind::BackupFailure)
    }

    fn take_inner(&self, environment: &str) -> Result<BackupSnapshot> {
        let id = BackupId::new();
        let taken_at = self.clock.now();
        let dir = self.root.join(environment);
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let file = dir.join(format!("{}-{}.dump", taken_at.format("%Y%m%d-%H%M%S"), id));
        let partial = file.with_extension("dump.partial");

        if let Err(e) = self.backup.dump(environment, &partial) {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
        std::fs::rename(&partial, &file).with_context(|| format!("finalize {}", file.display()))?;

        let snapshot = BackupSnapshot {
            id,
            environment: environment.to_string(),
            taken_at,
            store_ref: file.display().to_string(),
        };
        self.ledger.record_backup(&snapshot)?;
        tracing::info!(environment, backup = %snapshot.id, path = %snapshot.store_ref, "store backed up");
        Ok(snapshot)
    }

    pub fn latest(&self, environment: &str) -> Result<Option<BackupSnapshot>> {
        Ok(self.ledger.backups(environment)?.pop())
    }

    pub fn list(&self, environment: &str) -> Result<Vec<BackupSnapshot>> {
        self.ledger.backups(environment)
    }

    pub fn find(&self, environment: &str, id: &BackupId) -> Result<BackupSnapshot> {
        self.ledger
            .backups(environment)?
            .into_iter()
            .find(|b| &b.id == id)
            .ok_or_else(|| anyhow!("backup {id} not found for {environment}"))
    }

    /// Load `snapshot` into the store of `environment`, which need not be the
    /// environment it was taken from.
    pub fn restore(&self, environment: &str, snapshot: &BackupSnapshot) -> Result<()> {
        let path = PathBuf::from(&snapshot.store_ref);
        if !path.exists() {
            return Err(anyhow!("backup file {} is missing", path.display()));
        }
        self.backup
            .restore(environment, &path)
            .with_context(|| format!("restore backup {} into {environment}", snapshot.id))?;
        tracing::info!(environment, backup = %snapshot.id, from = %snapshot.environment, "store restored");
        Ok(())
    }

    /// Drop all but the newest `keep` snapshots. The backup referenced by the
    /// active deployment is always kept, since rollback may need it.
    pub fn prune(&self, environment: &str, keep: usize) -> Result<Vec<BackupSnapshot>> {
        let pinned = self.ledger.active_deployment(environment)?.and_then(|r| r.backup_id);
        let all = self.ledger.backups(environment)?;
        let cutoff = all.len().saturating_sub(keep);
        let mut removed = Vec::new();
        for snapshot in all.into_iter().take(cutoff) {
            if pinned.as_ref() == Some(&snapshot.id) {
                tracing::info!(backup = %snapshot.id, "kept: referenced by active deployment");
                continue;
            }
            match std::fs::remove_file(&snapshot.store_ref) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("remove {}", snapshot.store_ref)),
            }
            self.ledger.delete_backup(&snapshot.id)?;
            removed.push(snapshot);
        }
        Ok(removed)
    }
}
