//! changeguard: apply source changes to a repository atomically.
//!
//! `changeguard apply proposal.json` snapshots the working tree, checks the environment,
//! dry-runs the diff, applies it, runs the declared tests and commits. Any failure restores
//! the snapshot.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use changeguard::core::types::ChangeStatus;
use changeguard::exit_codes;
use changeguard::io::checksum::tree_checksum;
use changeguard::io::config::{ChangeguardConfig, default_config_path, load_config};
use changeguard::io::init::{InitOptions, init_state_dir};
use changeguard::io::lock::StateLock;
use changeguard::io::proposal::load_proposal;
use changeguard::io::tool::SystemToolRunner;
use changeguard::logging;
use changeguard::protocol::Orchestrator;

#[derive(Parser)]
#[command(
    name = "changeguard",
    version,
    about = "Atomic change protocol: snapshot, validate, apply, test, commit or roll back"
)]
struct Cli {
    /// Working tree to operate on.
    #[arg(long, global = true, default_value = ".")]
    workdir: PathBuf,

    /// Config file (default: `<workdir>/.changeguard/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.changeguard/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Check that git, the test runner and the copy tool are usable.
    CheckEnv {
        #[arg(long)]
        json: bool,
    },
    /// Run the atomic change protocol for a proposal file.
    Apply {
        proposal: PathBuf,
        /// Print the full outcome as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the content checksum of the working tree.
    Checksum,
    /// Inspect and manage snapshots.
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
}

#[derive(Subcommand)]
enum SnapshotCommand {
    /// List snapshots left on disk.
    List,
    /// Take a snapshot of the working tree.
    Create,
    /// Check a backup against its recorded checksum.
    Verify { id: String },
    /// Restore the working tree from a snapshot (removes the snapshot).
    Restore { id: String },
    /// Delete a snapshot.
    Discard { id: String },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let workdir = fs::canonicalize(&cli.workdir)
        .with_context(|| format!("resolve workdir {}", cli.workdir.display()))?;

    if let Command::Init { force } = cli.command {
        let paths = init_state_dir(&workdir, &InitOptions { force })?;
        println!("wrote {}", paths.config_path.display());
        return Ok(exit_codes::OK);
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(&workdir));
    let cfg = load_config(&config_path)?;

    match cli.command {
        Command::Init { .. } => Ok(exit_codes::OK),
        Command::CheckEnv { json } => cmd_check_env(&workdir, cfg, json),
        Command::Apply { proposal, json } => cmd_apply(&workdir, cfg, &proposal, json),
        Command::Checksum => cmd_checksum(&workdir, &cfg),
        Command::Snapshot { command } => cmd_snapshot(&workdir, cfg, command),
    }
}

fn cmd_check_env(workdir: &Path, cfg: ChangeguardConfig, json: bool) -> Result<i32> {
    let orchestrator = Orchestrator::new(workdir, cfg, SystemToolRunner);
    let report = orchestrator.environment().validate()?;
    if json {
        print_json(&report)?;
    } else {
        for line in &report.checked {
            println!("ok: {line}");
        }
        for problem in &report.problems {
            println!("problem: {problem}");
        }
    }
    Ok(if report.is_ok() {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

fn cmd_apply(workdir: &Path, cfg: ChangeguardConfig, proposal_path: &Path, json: bool) -> Result<i32> {
    let proposal = load_proposal(proposal_path)?;
    let _lock = StateLock::acquire(&cfg.state_dir_in(workdir))?;
    let orchestrator = Orchestrator::new(workdir, cfg, SystemToolRunner);
    let outcome = orchestrator.atomic_change(&proposal);
    let code = exit_codes::for_status(outcome.status);
    if json {
        print_json(&outcome)?;
    } else if outcome.status == ChangeStatus::Success {
        println!("{}", outcome.message);
    } else {
        eprintln!("{}: {}", outcome.status, outcome.message);
    }
    Ok(code)
}

fn cmd_checksum(workdir: &Path, cfg: &ChangeguardConfig) -> Result<i32> {
    let digest = tree_checksum(workdir, &cfg.exclude_rules(workdir))?;
    println!("{}  {} files", digest.checksum, digest.file_count);
    Ok(exit_codes::OK)
}

fn cmd_snapshot(workdir: &Path, cfg: ChangeguardConfig, command: SnapshotCommand) -> Result<i32> {
    let state_dir = cfg.state_dir_in(workdir);
    let orchestrator = Orchestrator::new(workdir, cfg, SystemToolRunner);
    let store = orchestrator.snapshots();
    match command {
        SnapshotCommand::List => {
            for snapshot in store.list()? {
                println!(
                    "{}  {}  {} files  {}",
                    snapshot.snapshot_id,
                    snapshot.created_at.to_rfc3339(),
                    snapshot.file_count,
                    snapshot.checksum
                );
            }
            Ok(exit_codes::OK)
        }
        SnapshotCommand::Create => {
            let _lock = StateLock::acquire(&state_dir)?;
            let snapshot = store.create()?;
            println!("{}", snapshot.snapshot_id);
            Ok(exit_codes::OK)
        }
        SnapshotCommand::Verify { id } => {
            let snapshot = store.load(&id)?;
            store.verify(&snapshot)?;
            println!("{id}: ok");
            Ok(exit_codes::OK)
        }
        SnapshotCommand::Restore { id } => {
            let _lock = StateLock::acquire(&state_dir)?;
            let snapshot = store.load(&id)?;
            // A backup that does not verify is refused before the tree is touched.
            store.verify(&snapshot)?;
            if let Err(err) = store.restore(&snapshot) {
                eprintln!("restore of {id} failed: {err:#}");
                return Ok(exit_codes::FAILED);
            }
            println!("restored {id}");
            Ok(exit_codes::OK)
        }
        SnapshotCommand::Discard { id } => {
            let snapshot = store.load(&id)?;
            if snapshot.source_path != workdir {
                bail!(
                    "snapshot {id} belongs to {}, not {}",
                    snapshot.source_path.display(),
                    workdir.display()
                );
            }
            store.discard(&snapshot)?;
            println!("discarded {id}");
            Ok(exit_codes::OK)
        }
    }
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
