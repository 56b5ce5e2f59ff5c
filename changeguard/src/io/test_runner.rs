//! Runs a proposal's declared test command and classifies the result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::command_line::split_command_line;
use crate::core::types::{TestReport, TestVerdict};
use crate::io::config::ChangeguardConfig;
use crate::io::tool::{ToolOutput, ToolRequest, ToolRunner};

/// Lines of test output kept in a failure reason.
const REASON_TAIL_LINES: usize = 20;

pub struct TestRunner<'a, R: ToolRunner> {
    runner: &'a R,
    workdir: PathBuf,
    program: String,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl<'a, R: ToolRunner> TestRunner<'a, R> {
    pub fn new(runner: &'a R, workdir: &Path, cfg: &ChangeguardConfig) -> Self {
        Self {
            runner,
            workdir: workdir.to_path_buf(),
            program: cfg.tools.test_runner.program.clone(),
            timeout: cfg.test_timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }

    /// Run `test_command` in the working tree under the test timeout.
    ///
    /// The command is split into argv and executed directly. Only the configured test runner
    /// program may be invoked; anything else is a `Failed` verdict without running it. `Err`
    /// means the runner could not be spawned.
    #[instrument(skip_all, fields(test_command = %test_command, timeout_secs = self.timeout.as_secs()))]
    pub fn run(&self, test_command: &str) -> Result<TestReport> {
        let argv = match split_command_line(test_command) {
            Ok(argv) => argv,
            Err(err) => return Ok(invalid(format!("invalid test command: {err}"))),
        };
        let Some((program, args)) = argv.split_first() else {
            return Ok(invalid("invalid test command: command is empty".to_string()));
        };
        if *program != self.program {
            warn!(%program, allowed = %self.program, "test command rejected");
            return Ok(invalid(format!(
                "invalid test command: must start with `{}`, got `{program}`",
                self.program
            )));
        }

        let request = ToolRequest::new(program, &self.workdir)
            .args(args.iter().cloned())
            .timeout(self.timeout)
            .output_limit(self.output_limit_bytes);
        let output = self.runner.run(&request)?;
        let report = classify(&output, self.timeout);
        info!(verdict = ?report.verdict, exit_code = ?report.exit_code, duration_ms = report.duration_ms, "tests finished");
        Ok(report)
    }
}

fn classify(output: &ToolOutput, timeout: Duration) -> TestReport {
    let (verdict, failure_reason) = if output.timed_out {
        (
            TestVerdict::TimedOut,
            Some(format!("timed out after {}s", timeout.as_secs())),
        )
    } else if output.success() {
        (TestVerdict::Passed, None)
    } else {
        let code = output
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "none (killed by signal)".to_string());
        let detail = tail(&output.diagnostic(), REASON_TAIL_LINES);
        let reason = if detail.is_empty() {
            format!("exit code {code}")
        } else {
            format!("exit code {code}: {detail}")
        };
        (TestVerdict::Failed, Some(reason))
    };
    TestReport {
        verdict,
        exit_code: output.exit_code,
        stdout: output.stdout_lossy(),
        stderr: output.stderr_lossy(),
        failure_reason,
        duration_ms: u64::try_from(output.duration.as_millis()).unwrap_or(u64::MAX),
    }
}

fn invalid(reason: String) -> TestReport {
    TestReport {
        verdict: TestVerdict::Failed,
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        failure_reason: Some(reason),
        duration_ms: 0,
    }
}

fn tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
