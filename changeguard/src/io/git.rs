//! Git adapter.
//!
//! The protocol uses git for repository checks, diff application and commits, so we keep a
//! small, explicit wrapper around `git` invocations. Every call goes through a [`ToolRunner`]
//! with a timeout, so tests can script git and no call can hang the protocol.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::exclude::ExcludeRules;
use crate::io::config::ChangeguardConfig;
use crate::io::tool::{ToolOutput, ToolRequest, ToolRunner};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git<'a, R: ToolRunner> {
    runner: &'a R,
    program: String,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl<'a, R: ToolRunner> Git<'a, R> {
    pub fn new(runner: &'a R, workdir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            program: "git".to_string(),
            workdir: workdir.into(),
            timeout: Duration::from_secs(60),
            output_limit_bytes: 100_000,
        }
    }

    /// Git for `workdir` using the configured program, timeout and output limit.
    pub fn from_config(runner: &'a R, workdir: impl Into<PathBuf>, cfg: &ChangeguardConfig) -> Self {
        Self {
            runner,
            program: cfg.tools.git.program.clone(),
            workdir: workdir.into(),
            timeout: cfg.tool_timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }

    /// True if `workdir` is inside a git work tree.
    pub fn is_repository(&self) -> Result<bool> {
        let output = self.run(&["rev-parse", "--is-inside-work-tree"], None)?;
        Ok(output.success() && output.stdout_lossy().trim() == "true")
    }

    /// Path of `workdir` relative to the repository top level, with a trailing `/`.
    ///
    /// Empty when `workdir` is the top level.
    pub fn show_prefix(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--show-prefix"])?;
        Ok(out.trim().to_string())
    }

    /// Create an empty repository in `workdir`.
    pub fn init(&self) -> Result<()> {
        self.run_checked(&["init", "-q"], None)?;
        Ok(())
    }

    /// Return the current HEAD SHA.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Return the subject of the HEAD commit.
    pub fn head_subject(&self) -> Result<String> {
        let out = self.run_capture(&["log", "-1", "--format=%s"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is clean, ignoring entries under excluded paths.
    #[instrument(skip_all)]
    pub fn ensure_clean_except(&self, excluded: &ExcludeRules) -> Result<()> {
        let entries = self.status_porcelain()?;
        let mut disallowed = Vec::new();
        for entry in entries {
            if excluded.is_excluded(Path::new(&entry.path)) {
                continue;
            }
            disallowed.push(entry);
        }
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean (uncommitted changes):\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// `git apply --check -`: report whether `diff` applies cleanly without writing anything.
    ///
    /// A diff that does not apply is an `Ok` output with a non-zero exit code.
    #[instrument(skip_all)]
    pub fn apply_check(&self, diff: &str) -> Result<ToolOutput> {
        self.run(&["apply", "--check", "-"], Some(diff))
    }

    /// `git apply -`: write `diff` to the working tree.
    #[instrument(skip_all)]
    pub fn apply(&self, diff: &str) -> Result<ToolOutput> {
        self.run(&["apply", "-"], Some(diff))
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"], None)?;
        Ok(())
    }

    /// Stage all changes except excluded paths.
    pub fn add_all_except(&self, excluded: &ExcludeRules) -> Result<()> {
        let pathspecs = excluded.git_exclude_pathspecs();
        let mut args = vec!["add", "-A", "--", "."];
        args.extend(pathspecs.iter().map(String::as_str));
        self.run_checked(&args, None)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-q", "-m", message], None)?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args, None)?;
        Ok(output.stdout_lossy())
    }

    fn run_checked(&self, args: &[&str], stdin: Option<&str>) -> Result<ToolOutput> {
        let output = self.run(args, stdin)?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            ));
        }
        if !output.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.diagnostic()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<ToolOutput> {
        let mut request = ToolRequest::new(&self.program, &self.workdir)
            .args(args.iter().copied())
            .timeout(self.timeout)
            .output_limit(self.output_limit_bytes);
        if let Some(input) = stdin {
            request = request.stdin(input.as_bytes());
        }
        self.runner.run(&request)
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
