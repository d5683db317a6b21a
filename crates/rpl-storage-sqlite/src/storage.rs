use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rpl_core::{
    BackupId, BackupSnapshot, DeploymentId, DeploymentKind, DeploymentRecord, LockId, PipelineState, RunId,
    StageStatus,
};
use rpl_storage::{EnvLock, Ledger, StageEntry};

pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path).with_context(|| format!("open sqlite db {}", db_path.display()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        let init_sql = include_str!("../migrations/0001_init.sql");
        conn.execute_batch(init_sql).context("apply ledger schema")?;
        tracing::debug!(db = %db_path.display(), "ledger opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("sqlite ledger lock poisoned"))
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp in ledger: {raw}"))?
        .with_timezone(&Utc))
}

fn from_unix(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| anyhow!("bad unix timestamp in ledger: {secs}"))
}

fn parse_state(raw: &str) -> Result<PipelineState> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .with_context(|| format!("unknown pipeline state in ledger: {raw}"))
}

fn parse_status(raw: &str) -> Result<StageStatus> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .with_context(|| format!("unknown stage status in ledger: {raw}"))
}

struct DeploymentRow {
    id: String,
    environment: String,
    version: String,
    artifacts_json: String,
    deployed_at: String,
    previous_version: Option<String>,
    kind: String,
    migrations_ran: bool,
    backup_id: Option<String>,
}

impl DeploymentRow {
    fn into_record(self) -> Result<DeploymentRecord> {
        Ok(DeploymentRecord {
            id: DeploymentId::from_str(self.id),
            environment: self.environment,
            version: self.version,
            artifacts: serde_json::from_str(&self.artifacts_json).context("parse deployment artifacts")?,
            deployed_at: parse_time(&self.deployed_at)?,
            previous_version: self.previous_version,
            kind: DeploymentKind::parse(&self.kind),
            migrations_ran: self.migrations_ran,
            backup_id: self.backup_id.map(BackupId::from_str),
        })
    }
}

impl Ledger for SqliteLedger {
    fn append_deployment(&self, record: &DeploymentRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO deployments(id, environment, version, artifacts_json, deployed_at, previous_version, kind, migrations_ran, backup_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id.0,
                record.environment,
                record.version,
                serde_json::to_string(&record.artifacts)?,
                record.deployed_at.to_rfc3339(),
                record.previous_version,
                record.kind.as_str(),
                record.migrations_ran,
                record.backup_id.as_ref().map(|b| b.0.clone()),
            ],
        )
        .with_context(|| format!("append deployment {}", record.version))?;
        Ok(())
    }

    fn deployments(&self, environment: &str) -> Result<Vec<DeploymentRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, environment, version, artifacts_json, deployed_at, previous_version, kind, migrations_ran, backup_id
             FROM deployments WHERE environment=?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([environment], |r| {
            Ok(DeploymentRow {
                id: r.get(0)?,
                environment: r.get(1)?,
                version: r.get(2)?,
                artifacts_json: r.get(3)?,
                deployed_at: r.get(4)?,
                previous_version: r.get(5)?,
                kind: r.get(6)?,
                migrations_ran: r.get(7)?,
                backup_id: r.get(8)?,
            })
        })?;
        let mut out = vec![];
        for row in rows {
            out.push(row?.into_record()?);
        }
        Ok(out)
    }

    fn record_backup(&self, snapshot: &BackupSnapshot) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO backups(id, environment, taken_at, store_ref) VALUES (?1, ?2, ?3, ?4)",
            params![snapshot.id.0, snapshot.environment, snapshot.taken_at.to_rfc3339(), snapshot.store_ref],
        )?;
        Ok(())
    }

    fn backups(&self, environment: &str) -> Result<Vec<BackupSnapshot>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, environment, taken_at, store_ref FROM backups WHERE environment=?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map([environment], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?;
        let mut out = vec![];
        for row in rows {
            let (id, environment, taken_at, store_ref) = row?;
            out.push(BackupSnapshot {
                id: BackupId::from_str(id),
                environment,
                taken_at: parse_time(&taken_at)?,
                store_ref,
            });
        }
        Ok(out)
    }

    fn delete_backup(&self, id: &BackupId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM backups WHERE id=?1", params![id.0])?;
        Ok(())
    }

    fn try_acquire_lock(&self, environment: &str, holder: &str, ttl_secs: i64, now: DateTime<Utc>) -> Result<Option<LockId>> {
        let conn = self.conn()?;
        let now_unix = now.timestamp();

        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM locks WHERE expires_at <= ?1", params![now_unix])?;

        // primary key on environment makes this exclusive
        let lock_id = LockId::new();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO locks(environment, id, holder, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![environment, lock_id.0, holder, now_unix, now_unix + ttl_secs],
        )?;
        tx.commit()?;

        if inserted == 1 {
            Ok(Some(lock_id))
        } else {
            Ok(None)
        }
    }

    fn renew_lock(&self, environment: &str, id: &LockId, ttl_secs: i64, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let now_unix = now.timestamp();
        let updated = conn.execute(
            "UPDATE locks SET expires_at=?1 WHERE environment=?2 AND id=?3 AND expires_at > ?4",
            params![now_unix + ttl_secs, environment, id.0, now_unix],
        )?;
        Ok(updated == 1)
    }

    fn release_lock(&self, environment: &str, id: &LockId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM locks WHERE environment=?1 AND id=?2", params![environment, id.0])?;
        Ok(())
    }

    fn current_lock(&self, environment: &str, now: DateTime<Utc>) -> Result<Option<EnvLock>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, holder, acquired_at, expires_at FROM locks WHERE environment=?1 AND expires_at > ?2",
                params![environment, now.timestamp()],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, i64>(2)?,
                        r.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((id, holder, acquired_at, expires_at)) => Ok(Some(EnvLock {
                id: LockId::from_str(id),
                environment: environment.to_string(),
                holder,
                acquired_at: from_unix(acquired_at)?,
                expires_at: from_unix(expires_at)?,
            })),
        }
    }

    fn record_stage(&self, entry: &StageEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO run_stages(run_id, command, state, status, detail, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.run_id.0,
                entry.command,
                entry.state.as_str(),
                entry.status.as_str(),
                entry.detail,
                entry.recorded_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn recent_stages(&self, limit: usize) -> Result<Vec<StageEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, command, state, status, detail, recorded_at FROM run_stages ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
                r.get::<_, String>(5)?,
            ))
        })?;
        let mut out = vec![];
        for row in rows {
            let (run_id, command, state, status, detail, recorded_at) = row?;
            out.push(StageEntry {
                run_id: RunId::from_str(run_id),
                command,
                state: parse_state(&state)?,
                status: parse_status(&status)?,
                detail,
                recorded_at: parse_time(&recorded_at)?,
            });
        }
        Ok(out)
    }
}
