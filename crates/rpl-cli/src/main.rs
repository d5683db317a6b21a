use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rpl_core::{FailureKind, RollbackOutcome, EXIT_OK, EXIT_PRECONDITION};
use rpl_runner::{
    CancelToken, DeployOptions, Pipeline, PipelineReport, RollbackOptions, RunOptions, TestOptions,
};

#[derive(Parser)]
#[command(name = "rpl", version)]
struct Cli {
    /// Print pipeline reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize rpl in the current repo (creates .rpl/, config, suite, db)
    Init,

    /// Check the checkout, config, suite and docker before a release
    Doctor,

    /// Tag HEAD, build every component and verify provenance
    Build,

    /// Run the test suite against a built release
    Test {
        /// Release tag (defaults to the newest local release)
        #[arg(long)]
        release: Option<String>,
        /// Restore the newest production backup into the test store first
        #[arg(long)]
        load_prod_data: bool,
        /// Only run tests whose id contains this string (not recorded on the release)
        #[arg(long)]
        filter: Option<String>,
    },

    /// Content-gate and publish a tested release
    Push {
        #[arg(long)]
        release: Option<String>,
    },

    /// Deploy a published release, or roll back with --rollback
    Deploy {
        /// Release tag to deploy; with --rollback, the earlier release to re-activate
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        skip_backup: bool,
        #[arg(long)]
        skip_migrations: bool,
        #[arg(long)]
        rollback: bool,
        /// With --rollback, also restore the store from the active deployment's backup
        #[arg(long, requires = "rollback")]
        restore_store: bool,
    },

    /// Build, test, push and deploy HEAD in one go
    Run {
        #[arg(long)]
        load_prod_data: bool,
        #[arg(long)]
        skip_backup: bool,
        #[arg(long)]
        skip_migrations: bool,
    },

    /// Active deployment, environment lock and recent stages
    Status,

    /// Deployment records, oldest first
    History {
        #[arg(long)]
        env: Option<String>,
    },

    Backup {
        #[command(subcommand)]
        cmd: BackupCommand,
    },
}

#[derive(Subcommand)]
enum BackupCommand {
    List {
        #[arg(long)]
        env: Option<String>,
    },
    /// Delete all but the newest backups; the active deployment's backup is kept
    Prune {
        #[arg(long)]
        env: Option<String>,
        #[arg(long)]
        keep: Option<usize>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_PRECONDITION
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let repo_root = std::env::current_dir()?;

    let open = || -> anyhow::Result<Pipeline> {
        let cancel = CancelToken::new();
        let handler = cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!("cancelling at the next stage boundary...");
            handler.cancel();
        })
        .context("install Ctrl-C handler")?;
        Pipeline::open(repo_root.clone(), cancel)
    };

    let report = match cli.cmd {
        Command::Init => {
            Pipeline::init_repo(&repo_root)?;
            println!("Initialized rpl in {}", repo_root.display());
            return Ok(EXIT_OK);
        }
        Command::Doctor => {
            for line in open()?.doctor()? {
                println!("ok  {line}");
            }
            return Ok(EXIT_OK);
        }
        Command::Build => open()?.build(),
        Command::Test { release, load_prod_data, filter } => {
            open()?.test(&TestOptions { release, load_prod_data, filter })
        }
        Command::Push { release } => open()?.push(release.as_deref()),
        Command::Deploy { version, skip_backup, skip_migrations, rollback, restore_store } => {
            let p = open()?;
            if rollback {
                p.rollback(&RollbackOptions { version, restore_store })
            } else {
                let version = version.ok_or_else(|| anyhow!("deploy needs --version <tag> (or --rollback)"))?;
                p.deploy(&DeployOptions { version, skip_backup, skip_migrations })
            }
        }
        Command::Run { load_prod_data, skip_backup, skip_migrations } => {
            open()?.run(&RunOptions { load_prod_data, skip_backup, skip_migrations })
        }
        Command::Status => {
            let status = open()?.status()?;
            println!("Environment: {}", status.environment);
            match &status.active {
                Some(r) => println!(
                    "Active: {} ({:?}, deployed {}, previous {})",
                    r.version,
                    r.kind,
                    r.deployed_at.to_rfc3339(),
                    r.previous_version.as_deref().unwrap_or("none")
                ),
                None => println!("Active: none"),
            }
            if let Some(lock) = &status.lock {
                println!("Locked by {} until {}", lock.holder, lock.expires_at.to_rfc3339());
            }
            if let Some(release) = &status.latest_release {
                println!(
                    "Latest release: {} verified={} tests={} gate={} published={}",
                    release.version,
                    release.verified,
                    release.tests_passed(),
                    release.gate_passed(),
                    release.is_published()
                );
            }
            println!("Recent stages:");
            for s in status.recent_stages {
                println!(
                    "- {} {} {} [{}] {}",
                    s.recorded_at.to_rfc3339(),
                    s.command,
                    s.state,
                    s.status.as_str(),
                    s.detail.unwrap_or_default()
                );
            }
            return Ok(EXIT_OK);
        }
        Command::History { env } => {
            let records = open()?.history(env.as_deref())?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for r in records {
                    println!(
                        "{} {:<8} {} previous={} migrations={} backup={}",
                        r.deployed_at.to_rfc3339(),
                        r.kind.as_str(),
                        r.version,
                        r.previous_version.as_deref().unwrap_or("-"),
                        r.migrations_ran,
                        r.backup_id.map(|b| b.0).unwrap_or_else(|| "-".to_string())
                    );
                }
            }
            return Ok(EXIT_OK);
        }
        Command::Backup { cmd } => {
            let p = open()?;
            match cmd {
                BackupCommand::List { env } => {
                    for b in p.backup_list(env.as_deref())? {
                        println!("{} {} {}", b.taken_at.to_rfc3339(), b.id, b.store_ref);
                    }
                }
                BackupCommand::Prune { env, keep } => {
                    let removed = p.backup_prune(env.as_deref(), keep)?;
                    println!("Removed {} backup(s)", removed.len());
                }
            }
            return Ok(EXIT_OK);
        }
    };

    print_report(&report, cli.json)?;
    Ok(report.exit_code())
}

fn print_report(report: &PipelineReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let path: Vec<&str> = report.trail.visited.iter().map(|s| s.as_str()).collect();
    println!("{}", path.join(" -> "));
    println!("{}", report.summary());
    let migration_failed = report.failure.as_ref().is_some_and(|f| f.kind == FailureKind::MigrationFailure);
    if migration_failed || matches!(report.rollback, Some(RollbackOutcome::Failed { .. })) {
        eprintln!("manual intervention required; see `rpl status` and `rpl history`");
    }
    Ok(())
}
