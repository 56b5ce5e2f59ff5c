//! Injectable capability for invoking external tools.
//!
//! Every external executable the protocol touches (git, rsync, the declared test runner,
//! runtime version checks) goes through [`ToolRunner`]. Tests substitute scripted runners that return
//! predetermined outputs without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::io::process::capture_with_timeout;

/// A single tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRequest {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ToolRequest {
    pub fn new(program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.into(),
            stdin: None,
            timeout: Duration::from_secs(60),
            output_limit_bytes: 100_000,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    /// `program arg1 arg2`, for diagnostics.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Captured result of a tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ToolOutput {
    /// Zero exit code within the timeout.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Trimmed stderr, falling back to stdout, for failure messages.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr_lossy();
        if !stderr.trim().is_empty() {
            return stderr.trim().to_string();
        }
        self.stdout_lossy().trim().to_string()
    }

    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self {
            exit_code: None,
            timed_out: true,
            duration: after,
            ..Self::default()
        }
    }
}

/// Abstraction over process execution.
///
/// `Err` means the tool could not be run at all (missing binary, spawn failure). A tool that ran
/// and failed is an `Ok` with a non-zero exit code.
pub trait ToolRunner {
    fn run(&self, request: &ToolRequest) -> Result<ToolOutput>;
}

impl<T: ToolRunner + ?Sized> ToolRunner for &T {
    fn run(&self, request: &ToolRequest) -> Result<ToolOutput> {
        (**self).run(request)
    }
}

/// Runner that spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemToolRunner;

impl ToolRunner for SystemToolRunner {
    #[instrument(skip_all, fields(program = %request.program, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &ToolRequest) -> Result<ToolOutput> {
        debug!(command = %request.display(), workdir = %request.workdir.display(), "running tool");
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args).current_dir(&request.workdir);
        let captured = capture_with_timeout(
            cmd,
            request.stdin.as_deref(),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run {}", request.program))?;
        Ok(ToolOutput {
            exit_code: captured.exit_code,
            stdout: captured.stdout,
            stderr: captured.stderr,
            timed_out: captured.timed_out,
            duration: captured.duration,
        })
    }
}
