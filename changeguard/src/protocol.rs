//! Orchestration of one atomic change attempt.
//!
//! ```text
//! snapshot -> environment -> syntax dry run -> apply -> test -> commit
//! ```
//!
//! The first failing step stops the attempt and the snapshot is restored. The working tree
//! ends up either with the change applied and tested, or byte-identical to where it started
//! (excluding VCS metadata and caches). When the restore itself fails the outcome is
//! `Failed` and the backup is kept for manual recovery.

use std::path::PathBuf;

use tracing::{error, info, instrument, warn};

use crate::core::state::{ProtocolMachine, ProtocolState, Step};
use crate::core::types::{
    ChangeFailure, ChangeOutcome, ChangeProposal, ChangeStatus, CommitRecord, Snapshot,
    SyntaxReport, TestReport,
};
use crate::io::applier::ChangeApplier;
use crate::io::commit::CommitRecorder;
use crate::io::config::ChangeguardConfig;
use crate::io::environment::EnvironmentValidator;
use crate::io::snapshot::SnapshotStore;
use crate::io::syntax::SyntaxValidator;
use crate::io::test_runner::TestRunner;
use crate::io::tool::ToolRunner;

/// Runs proposals against one working tree.
///
/// The orchestrator does not lock the tree. Callers must make sure only one attempt runs per
/// working tree at a time (the CLI holds `<state_dir>/lock`).
#[derive(Debug)]
pub struct Orchestrator<R: ToolRunner> {
    workdir: PathBuf,
    config: ChangeguardConfig,
    runner: R,
}

impl<R: ToolRunner> Orchestrator<R> {
    pub fn new(workdir: impl Into<PathBuf>, config: ChangeguardConfig, runner: R) -> Self {
        Self {
            workdir: workdir.into(),
            config,
            runner,
        }
    }

    pub fn snapshots(&self) -> SnapshotStore<'_, R> {
        SnapshotStore::from_config(&self.runner, &self.workdir, &self.config)
    }

    pub fn environment(&self) -> EnvironmentValidator<'_, R> {
        EnvironmentValidator::new(&self.runner, &self.workdir, &self.config)
    }

    /// Run the full protocol for `proposal`.
    ///
    /// Never panics and never returns early with the tree half-modified: every failure after
    /// the snapshot is followed by a verified restore.
    #[instrument(skip_all, fields(proposal_id = %proposal.id, workdir = %self.workdir.display()))]
    pub fn atomic_change(&self, proposal: &ChangeProposal) -> ChangeOutcome {
        let mut attempt = Attempt::default();
        let store = self.snapshots();

        let snapshot = match store.create() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let failure = ChangeFailure::unexpected(Step::Snapshot, &err);
                error!(%failure, "snapshot failed; nothing was changed");
                attempt.fail_unrecoverable(failure.to_string());
                let message = format!("{failure}; working tree was not modified");
                return attempt.finish(proposal, ChangeStatus::Failed, message, Some(failure));
            }
        };
        attempt.snapshot_id = Some(snapshot.snapshot_id.clone());

        let result = attempt
            .advance(ProtocolState::SnapshotTaken, Step::Snapshot)
            .and_then(|()| self.run_steps(&mut attempt, proposal));

        match result {
            Ok(()) => {
                if let Err(err) = store.discard(&snapshot) {
                    warn!(err = %format!("{err:#}"), "failed to discard snapshot after success");
                }
                let message = success_message(proposal, attempt.commit.as_ref());
                info!(%message, "change succeeded");
                attempt.finish(proposal, ChangeStatus::Success, message, None)
            }
            Err(failure) => self.recover(attempt, proposal, &store, &snapshot, failure),
        }
    }

    fn run_steps(&self, attempt: &mut Attempt, proposal: &ChangeProposal) -> Result<(), ChangeFailure> {
        let report = self
            .environment()
            .validate()
            .map_err(|err| ChangeFailure::unexpected(Step::Environment, &err))?;
        if !report.is_ok() {
            return Err(ChangeFailure::environment(report.summary()));
        }
        attempt.advance(ProtocolState::EnvironmentValidated, Step::Environment)?;

        let syntax = SyntaxValidator::new(&self.runner, &self.workdir, &self.config)
            .check(&proposal.diff_content)?;
        attempt.syntax = Some(syntax);
        attempt.advance(ProtocolState::SyntaxChecked, Step::SyntaxCheck)?;

        ChangeApplier::new(&self.runner, &self.workdir, &self.config)
            .apply(&proposal.diff_content)?;
        attempt.advance(ProtocolState::Applied, Step::Apply)?;

        let tests = TestRunner::new(&self.runner, &self.workdir, &self.config)
            .run(&proposal.test_command)
            .map_err(|err| ChangeFailure::unexpected(Step::Test, &err))?;
        let verdict = tests
            .failure_reason
            .clone()
            .filter(|_| !tests.passed());
        attempt.tests = Some(tests);
        if let Some(reason) = verdict {
            return Err(ChangeFailure::test(reason));
        }
        attempt.advance(ProtocolState::Tested, Step::Test)?;

        let commit = CommitRecorder::new(&self.runner, &self.workdir, &self.config).commit(proposal);
        attempt.commit = Some(commit);
        attempt.advance(ProtocolState::Committed, Step::Commit)?;
        Ok(())
    }

    fn recover(
        &self,
        mut attempt: Attempt,
        proposal: &ChangeProposal,
        store: &SnapshotStore<'_, R>,
        snapshot: &Snapshot,
        failure: ChangeFailure,
    ) -> ChangeOutcome {
        warn!(%failure, state = %attempt.machine.state(), "step failed, restoring snapshot");
        match store.restore(snapshot) {
            Ok(()) => {
                let message = format!("rolled back to {}: {failure}", snapshot.snapshot_id);
                attempt.roll_back(failure.to_string());
                info!(%message, "change rolled back");
                attempt.finish(proposal, ChangeStatus::RolledBack, message, Some(failure))
            }
            Err(err) => {
                let rollback = ChangeFailure::rollback(format!(
                    "{err:#}; backup kept at {}",
                    snapshot.backup_path.display()
                ));
                error!(%failure, %rollback, "restore failed; manual intervention required");
                let message = format!("{failure}; {rollback}");
                attempt.fail_unrecoverable(message.clone());
                attempt.finish(proposal, ChangeStatus::Failed, message, Some(rollback))
            }
        }
    }
}

fn success_message(proposal: &ChangeProposal, commit: Option<&CommitRecord>) -> String {
    match commit {
        Some(CommitRecord::Committed { sha }) => {
            let short = sha.get(..12).unwrap_or(sha);
            format!("{} applied, tested and committed as {short}", proposal.id)
        }
        Some(CommitRecord::Failed { reason }) => format!(
            "{} applied and tested, but not recorded in history: {reason}",
            proposal.id
        ),
        Some(CommitRecord::NothingToCommit) | None => {
            format!("{} applied and tested; nothing to commit", proposal.id)
        }
    }
}

/// Mutable record of one attempt, turned into a [`ChangeOutcome`] at the end.
#[derive(Debug, Default)]
struct Attempt {
    machine: ProtocolMachine,
    snapshot_id: Option<String>,
    syntax: Option<SyntaxReport>,
    tests: Option<TestReport>,
    commit: Option<CommitRecord>,
}

impl Attempt {
    fn advance(&mut self, to: ProtocolState, step: Step) -> Result<(), ChangeFailure> {
        let from = self.machine.state();
        self.machine
            .advance_to(to)
            .map_err(|err| ChangeFailure::unexpected(step, &anyhow::Error::new(err)))?;
        info!(%from, %to, "protocol transition");
        Ok(())
    }

    fn roll_back(&mut self, reason: String) {
        if let Err(err) = self.machine.roll_back(reason) {
            error!(%err, "could not record rollback");
        }
    }

    fn fail_unrecoverable(&mut self, reason: String) {
        if let Err(err) = self.machine.fail_unrecoverable(reason) {
            error!(%err, "could not record failure");
        }
    }

    fn finish(
        self,
        proposal: &ChangeProposal,
        status: ChangeStatus,
        message: String,
        failure: Option<ChangeFailure>,
    ) -> ChangeOutcome {
        ChangeOutcome {
            proposal_id: proposal.id.clone(),
            status,
            message,
            failure,
            state: self.machine.state(),
            transitions: self.machine.into_transitions(),
            snapshot_id: self.snapshot_id,
            syntax: self.syntax,
            tests: self.tests,
            commit: self.commit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FailureKind;
    use crate::io::config::SyncBackend;
    use crate::io::tool::ToolOutput;
    use crate::test_support::{ScriptedToolRunner, sample_proposal};
    use std::fs;

    const DIFF: &str = "--- /dev/null\n+++ b/added.txt\n@@ -0,0 +1 @@\n+hello\n";

    fn config() -> ChangeguardConfig {
        let mut cfg = ChangeguardConfig::default();
        cfg.sync.backend = SyncBackend::Native;
        cfg.environment.check_runtime = false;
        cfg
    }

    /// Every tool call succeeds; git apply does not actually write anything.
    fn healthy() -> ScriptedToolRunner {
        ScriptedToolRunner::new()
            .on("git", &["rev-parse", "--is-inside-work-tree"], ToolOutput::ok("true\n"))
            .on("git", &["rev-parse", "HEAD"], ToolOutput::ok("0123456789abcdef0123\n"))
            .on("git", &["diff", "--cached"], ToolOutput::ok("added.txt\n"))
            .on("git", &[], ToolOutput::ok(""))
            .on("pytest", &[], ToolOutput::ok("1 passed\n"))
    }

    fn workdir() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("app.py"), "x = 1\n").expect("write");
        temp
    }

    #[test]
    fn happy_path_walks_every_state() {
        let temp = workdir();
        let orchestrator = Orchestrator::new(temp.path(), config(), healthy());
        let outcome = orchestrator.atomic_change(&sample_proposal("CG-1", DIFF));

        assert_eq!(outcome.status, ChangeStatus::Success, "{}", outcome.message);
        assert_eq!(outcome.state, ProtocolState::Committed);
        let states: Vec<ProtocolState> = outcome.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                ProtocolState::SnapshotTaken,
                ProtocolState::EnvironmentValidated,
                ProtocolState::SyntaxChecked,
                ProtocolState::Applied,
                ProtocolState::Tested,
                ProtocolState::Committed,
            ]
        );
        assert_eq!(
            outcome.message,
            "CG-1 applied, tested and committed as 0123456789ab"
        );
        assert!(orchestrator.snapshots().list().expect("list").is_empty());
    }

    #[test]
    fn environment_problem_rolls_back() {
        let temp = workdir();
        let runner = ScriptedToolRunner::new()
            .fails("pytest", "No such file or directory")
            .fallback_to(healthy());
        let orchestrator = Orchestrator::new(temp.path(), config(), runner);
        let outcome = orchestrator.atomic_change(&sample_proposal("CG-2", DIFF));

        assert_eq!(outcome.status, ChangeStatus::RolledBack);
        assert_eq!(outcome.state, ProtocolState::RolledBack);
        let failure = outcome.failure.as_ref().expect("failure");
        assert_eq!(failure.kind(), FailureKind::Environment);
        let snapshot_id = outcome.snapshot_id.clone().expect("snapshot id");
        assert!(
            outcome
                .message
                .starts_with(&format!("rolled back to {snapshot_id}: environment validation failed")),
            "{}",
            outcome.message
        );
    }

    #[test]
    fn failing_tests_roll_back_with_report() {
        let temp = workdir();
        let runner = ScriptedToolRunner::new()
            .on("pytest", &["tests"], ToolOutput::failed(1, "1 failed"))
            .fallback_to(healthy());
        let orchestrator = Orchestrator::new(temp.path(), config(), runner);
        let mut proposal = sample_proposal("CG-3", DIFF);
        proposal.test_command = "pytest tests".to_string();
        let outcome = orchestrator.atomic_change(&proposal);

        assert_eq!(outcome.status, ChangeStatus::RolledBack);
        assert_eq!(
            outcome.failure,
            Some(ChangeFailure::test("exit code 1: 1 failed"))
        );
        assert!(outcome.tests.is_some());
        assert!(outcome.commit.is_none());
    }

    #[test]
    fn commit_failure_keeps_the_change() {
        let temp = workdir();
        let runner = ScriptedToolRunner::new()
            .on("git", &["commit"], ToolOutput::failed(1, "hook rejected"))
            .fallback_to(healthy());
        let orchestrator = Orchestrator::new(temp.path(), config(), runner);
        let outcome = orchestrator.atomic_change(&sample_proposal("CG-4", DIFF));

        assert_eq!(outcome.status, ChangeStatus::Success);
        assert!(matches!(outcome.commit, Some(CommitRecord::Failed { .. })));
        assert!(outcome.message.contains("not recorded in history"));
    }

    #[test]
    fn snapshot_failure_is_unrecoverable_without_touching_tools() {
        let temp = tempfile::tempdir().expect("tempdir");
        let not_a_dir = temp.path().join("file");
        fs::write(&not_a_dir, "").expect("write");
        let runner = healthy();
        let orchestrator = Orchestrator::new(&not_a_dir, config(), &runner);
        let outcome = orchestrator.atomic_change(&sample_proposal("CG-5", DIFF));

        assert_eq!(outcome.status, ChangeStatus::Failed);
        assert_eq!(outcome.state, ProtocolState::FailedUnrecoverable);
        assert_eq!(outcome.transitions.len(), 1);
        assert_eq!(outcome.transitions[0].from, ProtocolState::Idle);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn restore_failure_reports_failed_and_keeps_backup() {
        let temp = workdir();
        // Apply "succeeds" but corrupts the backup, so the restore cannot verify it.
        let runner = ScriptedToolRunner::new()
            .on("pytest", &["-q"], ToolOutput::failed(1, "boom"))
            .fallback_to(healthy());
        let orchestrator = Orchestrator::new(temp.path(), config(), &runner);
        let store = orchestrator.snapshots();
        let proposal = sample_proposal("CG-6", DIFF);

        let outcome = {
            let corrupting = CorruptBackupRunner {
                inner: &runner,
                backup_root: store.backup_root().to_path_buf(),
            };
            Orchestrator::new(temp.path(), config(), corrupting).atomic_change(&proposal)
        };

        assert_eq!(outcome.status, ChangeStatus::Failed);
        assert_eq!(outcome.state, ProtocolState::FailedUnrecoverable);
        let failure = outcome.failure.expect("failure");
        assert_eq!(failure.kind(), FailureKind::Rollback);
        assert!(outcome.message.starts_with("tests failed: exit code 1: boom; rollback failed"));
        let snapshot_id = outcome.snapshot_id.expect("snapshot id");
        assert!(store.backup_root().join(&snapshot_id).is_dir());
    }

    /// Tampers with every backup when `git apply -` runs.
    struct CorruptBackupRunner<'a> {
        inner: &'a ScriptedToolRunner,
        backup_root: PathBuf,
    }

    impl ToolRunner for CorruptBackupRunner<'_> {
        fn run(&self, request: &crate::io::tool::ToolRequest) -> anyhow::Result<ToolOutput> {
            if request.program == "git" && request.args == ["apply", "-"] {
                for entry in fs::read_dir(&self.backup_root)? {
                    let path = entry?.path();
                    if path.is_dir() {
                        fs::write(path.join("app.py"), "tampered\n")?;
                    }
                }
            }
            self.inner.run(request)
        }
    }
}
