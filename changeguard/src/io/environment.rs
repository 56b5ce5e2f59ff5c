//! Pre-flight checks run before anything in the working tree is touched.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::version::Version;
use crate::io::config::{ChangeguardConfig, SyncBackend, ToolSpec};
use crate::io::git::Git;
use crate::io::tool::{ToolOutput, ToolRequest, ToolRunner};

/// Result of [`EnvironmentValidator::validate`]. No problems means the environment is usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentReport {
    /// One line per check that passed, e.g. `git: git version 2.43.0`.
    pub checked: Vec<String>,
    pub problems: Vec<String>,
}

impl EnvironmentReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn summary(&self) -> String {
        self.problems.join("; ")
    }

    fn pass(&mut self, line: String) {
        debug!(check = %line, "environment check passed");
        self.checked.push(line);
    }

    fn fail(&mut self, problem: String) {
        warn!(%problem, "environment check failed");
        self.problems.push(problem);
    }
}

/// Checks that every tool the protocol relies on is installed and usable.
pub struct EnvironmentValidator<'a, R: ToolRunner> {
    runner: &'a R,
    workdir: PathBuf,
    cfg: &'a ChangeguardConfig,
}

impl<'a, R: ToolRunner> EnvironmentValidator<'a, R> {
    pub fn new(runner: &'a R, workdir: &Path, cfg: &'a ChangeguardConfig) -> Self {
        Self {
            runner,
            workdir: workdir.to_path_buf(),
            cfg,
        }
    }

    /// Run every check and collect the problems. Nothing is modified.
    ///
    /// `Err` is reserved for failures of the checking itself; a missing tool is a problem in
    /// the report.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn validate(&self) -> Result<EnvironmentReport> {
        let mut report = EnvironmentReport::default();

        if self.cfg.environment.check_runtime {
            self.check_runtime(&mut report);
        }

        let git_ok = self.check_tool("git", &self.cfg.tools.git, &mut report);
        if git_ok {
            self.check_repository(&mut report)?;
        }

        self.check_tool("test runner", &self.cfg.tools.test_runner, &mut report);

        if self.cfg.sync.backend == SyncBackend::Rsync {
            self.check_tool("rsync", &self.cfg.tools.rsync, &mut report);
        }

        Ok(report)
    }

    fn check_runtime(&self, report: &mut EnvironmentReport) {
        let runtime = &self.cfg.environment.runtime;
        let spec = ToolSpec {
            program: runtime.program.clone(),
            check_args: runtime.check_args.clone(),
        };
        let Some(output) = self.run_check("runtime", &spec, report) else {
            return;
        };
        // Some runtimes print their version on stderr.
        let text = format!("{}\n{}", output.stdout_lossy(), output.stderr_lossy());
        let Some(found) = Version::find_in(&text) else {
            report.fail(format!(
                "could not read a version from `{} {}`",
                runtime.program,
                runtime.check_args.join(" ")
            ));
            return;
        };
        match runtime.min_version.parse::<Version>() {
            Ok(min) if found < min => report.fail(format!(
                "{} {found} is older than the required {min}",
                runtime.program
            )),
            Ok(_) => report.pass(format!("runtime: {} {found}", runtime.program)),
            Err(err) => report.fail(format!("invalid minimum runtime version: {err}")),
        }
    }

    fn check_repository(&self, report: &mut EnvironmentReport) -> Result<()> {
        let git = Git::from_config(self.runner, &self.workdir, self.cfg);
        if !git.is_repository()? {
            report.fail(format!(
                "{} is not a git repository",
                self.workdir.display()
            ));
            return Ok(());
        }
        // `git apply` resolves diff paths from the top level, so a subdirectory would
        // silently skip the patch.
        let prefix = git.show_prefix()?;
        if !prefix.is_empty() {
            report.fail(format!(
                "{} is not the top level of its git repository (subdirectory `{}`)",
                self.workdir.display(),
                prefix.trim_end_matches('/')
            ));
            return Ok(());
        }
        report.pass("repository: ok".to_string());

        if self.cfg.environment.require_clean_tree {
            match git.ensure_clean_except(&self.cfg.exclude_rules(&self.workdir)) {
                Ok(()) => report.pass("working tree: clean".to_string()),
                Err(err) => report.fail(err.to_string()),
            }
        }
        Ok(())
    }

    /// Run a tool's check arguments and record the result. Returns true when it ran successfully.
    fn check_tool(&self, label: &str, spec: &ToolSpec, report: &mut EnvironmentReport) -> bool {
        match self.run_check(label, spec, report) {
            Some(output) => {
                let first_line = output
                    .stdout_lossy()
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                report.pass(format!("{label}: {}", non_empty_or(first_line, &spec.program)));
                true
            }
            None => false,
        }
    }

    fn run_check(
        &self,
        label: &str,
        spec: &ToolSpec,
        report: &mut EnvironmentReport,
    ) -> Option<ToolOutput> {
        let request = ToolRequest::new(&spec.program, &self.workdir)
            .args(spec.check_args.iter().cloned())
            .timeout(self.cfg.tool_timeout())
            .output_limit(self.cfg.output_limit_bytes);
        match self.runner.run(&request) {
            Ok(output) if output.success() => Some(output),
            Ok(output) if output.timed_out => {
                report.fail(format!("{label} `{}` timed out", request.display()));
                None
            }
            Ok(output) => {
                report.fail(format!(
                    "{label} `{}` is not usable: {}",
                    request.display(),
                    output.diagnostic()
                ));
                None
            }
            Err(err) => {
                report.fail(format!(
                    "{label} `{}` is not available: {err:#}",
                    spec.program
                ));
                None
            }
        }
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedToolRunner;

    fn healthy() -> ScriptedToolRunner {
        ScriptedToolRunner::new()
            .on("python3", &["--version"], ToolOutput::ok("Python 3.12.1\n"))
            .on("git", &["--version"], ToolOutput::ok("git version 2.43.0\n"))
            .on("git", &["rev-parse", "--show-prefix"], ToolOutput::ok("\n"))
            .on("git", &["rev-parse"], ToolOutput::ok("true\n"))
            .on("git", &["status"], ToolOutput::ok(""))
            .on("pytest", &["--version"], ToolOutput::ok("pytest 8.0.0\n"))
            .on("rsync", &["--version"], ToolOutput::ok("rsync  version 3.2.7\n"))
    }

    #[test]
    fn healthy_environment_has_no_problems() {
        let runner = healthy();
        let cfg = ChangeguardConfig::default();
        let report = EnvironmentValidator::new(&runner, Path::new("/repo"), &cfg)
            .validate()
            .expect("validate");
        assert!(report.is_ok(), "{}", report.summary());
        assert!(report.checked.contains(&"git: git version 2.43.0".to_string()));
        assert!(report.checked.contains(&"runtime: python3 3.12.1".to_string()));
    }

    #[test]
    fn old_runtime_is_a_problem() {
        let runner = ScriptedToolRunner::new()
            .on("python3", &["--version"], ToolOutput::ok("Python 3.7.9\n"))
            .fallback_to(healthy());
        let cfg = ChangeguardConfig::default();
        let report = EnvironmentValidator::new(&runner, Path::new("/repo"), &cfg)
            .validate()
            .expect("validate");
        assert_eq!(report.problems, vec!["python3 3.7.9 is older than the required 3.8.0"]);
    }

    #[test]
    fn missing_tools_and_dirty_tree_are_reported_together() {
        let runner = ScriptedToolRunner::new()
            .on("git", &["status"], ToolOutput::ok(" M src/app.py\n"))
            .fails("rsync", "No such file or directory")
            .fallback_to(healthy());
        let cfg = ChangeguardConfig::default();
        let report = EnvironmentValidator::new(&runner, Path::new("/repo"), &cfg)
            .validate()
            .expect("validate");
        assert_eq!(report.problems.len(), 2, "{:?}", report.problems);
        assert!(report.summary().contains("src/app.py"));
        assert!(report.summary().contains("rsync"));
    }

    #[test]
    fn native_backend_skips_rsync_and_runtime_can_be_disabled() {
        let runner = ScriptedToolRunner::new()
            .fails("rsync", "not installed")
            .fails("python3", "not installed")
            .fallback_to(healthy());
        let mut cfg = ChangeguardConfig::default();
        cfg.sync.backend = SyncBackend::Native;
        cfg.environment.check_runtime = false;
        let report = EnvironmentValidator::new(&runner, Path::new("/repo"), &cfg)
            .validate()
            .expect("validate");
        assert!(report.is_ok(), "{}", report.summary());
    }

    #[test]
    fn not_a_repository() {
        let runner = ScriptedToolRunner::new()
            .on(
                "git",
                &["rev-parse"],
                ToolOutput::failed(128, "fatal: not a git repository"),
            )
            .fallback_to(healthy());
        let cfg = ChangeguardConfig::default();
        let report = EnvironmentValidator::new(&runner, Path::new("/repo"), &cfg)
            .validate()
            .expect("validate");
        assert_eq!(report.problems, vec!["/repo is not a git repository"]);
    }

    #[test]
    fn subdirectory_of_a_repository_is_a_problem() {
        let runner = ScriptedToolRunner::new()
            .on("git", &["rev-parse", "--show-prefix"], ToolOutput::ok("sub/\n"))
            .fallback_to(healthy());
        let cfg = ChangeguardConfig::default();
        let report = EnvironmentValidator::new(&runner, Path::new("/repo/sub"), &cfg)
            .validate()
            .expect("validate");
        assert_eq!(
            report.problems,
            vec!["/repo/sub is not the top level of its git repository (subdirectory `sub`)"]
        );
    }

    #[test]
    fn excluded_caches_do_not_make_the_tree_dirty() {
        let runner = ScriptedToolRunner::new()
            .on(
                "git",
                &["status"],
                ToolOutput::ok("?? .pytest_cache/v/cache/lastfailed\n?? pkg/__pycache__/m.pyc\n"),
            )
            .fallback_to(healthy());
        let cfg = ChangeguardConfig::default();
        let report = EnvironmentValidator::new(&runner, Path::new("/repo"), &cfg)
            .validate()
            .expect("validate");
        assert!(report.is_ok(), "{}", report.summary());
    }
}
