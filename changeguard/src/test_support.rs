//! Test-only helpers: scripted tool runner, throwaway git repositories, sample proposals.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};

use crate::core::types::ChangeProposal;
use crate::io::config::{ChangeguardConfig, SyncBackend, ToolSpec};
use crate::io::git::Git;
use crate::io::tool::{SystemToolRunner, ToolOutput, ToolRequest, ToolRunner};

#[derive(Debug, Clone)]
enum Response {
    Output(ToolOutput),
    SpawnError(String),
}

#[derive(Debug, Clone)]
struct Rule {
    program: String,
    args_prefix: Vec<String>,
    response: Response,
}

impl Rule {
    fn matches(&self, request: &ToolRequest) -> bool {
        request.program == self.program && request.args.starts_with(&self.args_prefix)
    }
}

/// Tool runner answering from a script instead of spawning processes.
///
/// Rules match on program name and an argument prefix; the first matching rule wins. Requests
/// no rule matches go to the fallback runner, or fail like a missing binary. Every request is
/// recorded.
#[derive(Debug, Default)]
pub struct ScriptedToolRunner {
    rules: Vec<Rule>,
    fallback: Option<Box<ScriptedToolRunner>>,
    calls: Mutex<Vec<ToolRequest>>,
}

impl ScriptedToolRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `program <args_prefix>...` with `output`.
    pub fn on(mut self, program: &str, args_prefix: &[&str], output: ToolOutput) -> Self {
        self.rules.push(Rule {
            program: program.to_string(),
            args_prefix: args_prefix.iter().map(|s| s.to_string()).collect(),
            response: Response::Output(output),
        });
        self
    }

    /// Make every invocation of `program` fail to spawn.
    pub fn fails(mut self, program: &str, message: &str) -> Self {
        self.rules.push(Rule {
            program: program.to_string(),
            args_prefix: Vec::new(),
            response: Response::SpawnError(message.to_string()),
        });
        self
    }

    /// Consult `other` for requests no rule of `self` matches.
    pub fn fallback_to(mut self, other: ScriptedToolRunner) -> Self {
        self.fallback = Some(Box::new(other));
        self
    }

    /// Requests seen so far, oldest first.
    pub fn calls(&self) -> Vec<ToolRequest> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn respond(&self, request: &ToolRequest) -> Result<ToolOutput> {
        if let Some(rule) = self.rules.iter().find(|rule| rule.matches(request)) {
            return match &rule.response {
                Response::Output(output) => Ok(output.clone()),
                Response::SpawnError(message) => {
                    Err(anyhow!("run {}: {message}", request.program))
                }
            };
        }
        match &self.fallback {
            Some(fallback) => fallback.respond(request),
            None => Err(anyhow!(
                "run {}: no scripted response for `{}`",
                request.program,
                request.display()
            )),
        }
    }
}

impl ToolRunner for ScriptedToolRunner {
    fn run(&self, request: &ToolRequest) -> Result<ToolOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        self.respond(request)
    }
}

/// A proposal with placeholder metadata and `pytest -q` as its test command.
pub fn sample_proposal(id: &str, diff: &str) -> ChangeProposal {
    ChangeProposal {
        id: id.to_string(),
        title: "Sample change".to_string(),
        target: "app.py".to_string(),
        impact_justification: "exercise the protocol".to_string(),
        difficulty: "Low".to_string(),
        diff_content: diff.to_string(),
        test_command: "pytest -q".to_string(),
        metrics: BTreeMap::new(),
    }
}

/// A git repository in a temp dir with one commit and a local identity.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { dir };
        repo.git_checked(&["init", "-q"])?;
        repo.git_checked(&["config", "user.email", "changeguard@example.com"])?;
        repo.git_checked(&["config", "user.name", "changeguard tests"])?;
        repo.git_checked(&["config", "commit.gpgsign", "false"])?;
        repo.write(".gitignore", "__pycache__/\n")?;
        repo.commit_all("chore: initial commit")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        let git = Git::new(&SystemToolRunner, self.path());
        git.add_all()?;
        git.commit_staged(message)?;
        Ok(())
    }

    pub fn head_subject(&self) -> Result<String> {
        Git::new(&SystemToolRunner, self.path()).head_subject()
    }

    pub fn head_sha(&self) -> Result<String> {
        Git::new(&SystemToolRunner, self.path()).head_sha()
    }

    /// Paths in the index, as `git ls-files` prints them.
    pub fn tracked_files(&self) -> Result<Vec<String>> {
        let output = self.git_checked(&["ls-files"])?;
        Ok(output.stdout_lossy().lines().map(str::to_string).collect())
    }

    /// Config for tests: native copies, no runtime version check, `sh` as the test runner.
    pub fn config(&self) -> ChangeguardConfig {
        let mut cfg = ChangeguardConfig::default();
        cfg.sync.backend = SyncBackend::Native;
        cfg.environment.check_runtime = false;
        cfg.tools.test_runner = ToolSpec {
            program: "sh".to_string(),
            check_args: vec!["-c".to_string(), "exit 0".to_string()],
        };
        cfg.test.timeout_secs = 30;
        cfg
    }

    fn git_checked(&self, args: &[&str]) -> Result<ToolOutput> {
        let request = ToolRequest::new("git", self.path()).args(args.iter().copied());
        let output = SystemToolRunner.run(&request)?;
        if !output.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.diagnostic()
            ));
        }
        Ok(output)
    }
}
