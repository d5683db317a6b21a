use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub fn run_cmd(dir: &Path, program: &str, args: &[&str]) -> Result<String> {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(dir);
    let out = cmd.output().with_context(|| format!("run {} {:?}", program, args))?;
    if !out.status.success() {
        return Err(anyhow!(
            "command failed: {} {:?}\nstdout:{}\nstderr:{}",
            program,
            args,
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Run `argv` with stdout redirected into `dest`.
pub fn run_cmd_to_file(dir: &Path, argv: &[String], dest: &Path) -> Result<()> {
    let (program, args) = argv.split_first().ok_or_else(|| anyhow!("empty command"))?;
    let file = std::fs::File::create(dest).with_context(|| format!("create {}", dest.display()))?;
    let out = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::from(file))
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("run {:?}", argv))?;
    if !out.status.success() {
        return Err(anyhow!("command failed: {:?}\nstderr:{}", argv, String::from_utf8_lossy(&out.stderr)));
    }
    Ok(())
}

/// Run `argv` with stdin fed from `src`.
pub fn run_cmd_from_file(dir: &Path, argv: &[String], src: &Path) -> Result<()> {
    let (program, args) = argv.split_first().ok_or_else(|| anyhow!("empty command"))?;
    let file = std::fs::File::open(src).with_context(|| format!("open {}", src.display()))?;
    let out = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::from(file))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("run {:?}", argv))?;
    if !out.status.success() {
        return Err(anyhow!(
            "command failed: {:?}\nstdout:{}\nstderr:{}",
            argv,
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        ));
    }
    Ok(())
}

/// Substitute `{key}` placeholders in every argument.
pub fn render_args(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter()
                .fold(arg.clone(), |acc, (k, v)| acc.replace(&format!("{{{k}}}"), v))
        })
        .collect()
}

pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_placeholders() {
        let t = vec!["run".to_string(), "--name={test}".to_string(), "{tier}".to_string()];
        assert_eq!(
            render_args(&t, &[("test", "api::x"), ("tier", "2")]),
            vec!["run", "--name=api::x", "2"]
        );
    }

    #[test]
    fn expands_home() {
        let p = expand_path("~/x");
        assert!(!p.to_string_lossy().starts_with('~'));
        assert_eq!(expand_path("/abs"), PathBuf::from("/abs"));
    }

    #[test]
    fn file_redirection_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("dump.txt");
        run_cmd_to_file(dir.path(), &["echo".to_string(), "hello".to_string()], &dump).unwrap();
        assert_eq!(std::fs::read_to_string(&dump).unwrap().trim(), "hello");
        run_cmd_from_file(dir.path(), &["cat".to_string()], &dump).unwrap();
        assert!(run_cmd_to_file(dir.path(), &[], &dump).is_err());
    }
}
