use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use rpl_core::TestId;

use crate::traits::{MigrationRunner, StoreBackup, TestExecutor};
use crate::util::{render_args, run_cmd_from_file, run_cmd_to_file};

/// Store dump/restore through operator-supplied commands.
#[derive(Clone, Debug)]
pub struct CommandStoreBackup {
    pub workdir: PathBuf,
    pub dump_command: Vec<String>,
    pub restore_command: Vec<String>,
}

impl StoreBackup for CommandStoreBackup {
    fn dump(&self, environment: &str, dest: &Path) -> Result<()> {
        if self.dump_command.is_empty() {
            return Err(anyhow!("backup.dump_command is not configured"));
        }
        let argv = render_args(&self.dump_command, &[("env", environment)]);
        run_cmd_to_file(&self.workdir, &argv, dest).with_context(|| format!("dump store of {environment}"))
    }

    fn restore(&self, environment: &str, src: &Path) -> Result<()> {
        if self.restore_command.is_empty() {
            return Err(anyhow!("backup.restore_command is not configured"));
        }
        let argv = render_args(&self.restore_command, &[("env", environment)]);
        run_cmd_from_file(&self.workdir, &argv, src).with_context(|| format!("restore store of {environment}"))
    }
}

#[derive(Clone, Debug)]
pub struct CommandMigrationRunner {
    pub workdir: PathBuf,
    pub command: Vec<String>,
}

impl MigrationRunner for CommandMigrationRunner {
    fn migrate(&self, environment: &str) -> Result<()> {
        let argv = render_args(&self.command, &[("env", environment)]);
        let (program, args) = argv.split_first().ok_or_else(|| anyhow!("deploy.migrate_command is not configured"))?;
        let out = Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("run {:?}", argv))?;
        if !out.status.success() {
            return Err(anyhow!(
                "migrations failed on {environment}\nstdout:{}\nstderr:{}",
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            ));
        }
        Ok(())
    }
}

/// Runs one test per process; exit status 0 is a pass.
#[derive(Clone, Debug)]
pub struct CommandTestExecutor {
    pub workdir: PathBuf,
    pub command: Vec<String>,
    pub environment: String,
}

impl TestExecutor for CommandTestExecutor {
    fn run_test(&self, test: &TestId, tier: u8) -> Result<bool> {
        let tier = tier.to_string();
        let argv = render_args(
            &self.command,
            &[("test", test.as_str()), ("tier", &tier), ("env", &self.environment)],
        );
        let (program, args) = argv.split_first().ok_or_else(|| anyhow!("test.command is not configured"))?;
        let out = Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("run {:?}", argv))?;
        if !out.status.success() {
            tracing::debug!(test = %test, tier = %tier, stderr = %String::from_utf8_lossy(&out.stderr), "test failed");
        }
        Ok(out.status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn dump_and_restore_use_files() {
        let dir = tempdir().unwrap();
        let backup = CommandStoreBackup {
            workdir: dir.path().to_path_buf(),
            dump_command: sh("echo rows-for-$0"),
            restore_command: sh("cat > restored.txt"),
        };
        let dump = dir.path().join("b.dump");
        backup.dump("production", &dump).unwrap();
        backup.restore("test", &dump).unwrap();
        let restored = std::fs::read_to_string(dir.path().join("restored.txt")).unwrap();
        assert!(restored.starts_with("rows-for-"));
    }

    #[test]
    fn executor_maps_exit_status() {
        let dir = tempdir().unwrap();
        let exec = CommandTestExecutor {
            workdir: dir.path().to_path_buf(),
            command: vec!["sh".into(), "-c".into(), "test \"{test}\" = ok".into()],
            environment: "test".into(),
        };
        assert!(exec.run_test(&TestId::from_str("ok"), 1).unwrap());
        assert!(!exec.run_test(&TestId::from_str("bad"), 1).unwrap());
    }

    #[test]
    fn unconfigured_commands_error() {
        let m = CommandMigrationRunner { workdir: PathBuf::from("."), command: vec![] };
        assert!(m.migrate("production").is_err());
    }
}
