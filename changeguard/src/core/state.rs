//! Linear state machine for a single atomic change attempt.
//!
//! The happy path is fixed:
//!
//! ```text
//! Idle -> SnapshotTaken -> EnvironmentValidated -> SyntaxChecked -> Applied -> Tested -> Committed
//! ```
//!
//! Every non-terminal state at or after `SnapshotTaken` may fail into `RolledBack` (restore
//! succeeded) or `FailedUnrecoverable` (restore failed). `Idle` may only fail into
//! `FailedUnrecoverable`, because without a snapshot there is nothing to restore.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol state of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    Idle,
    SnapshotTaken,
    EnvironmentValidated,
    SyntaxChecked,
    Applied,
    Tested,
    Committed,
    RolledBack,
    FailedUnrecoverable,
}

impl ProtocolState {
    /// Next state on the happy path, or `None` for terminal states.
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::SnapshotTaken),
            Self::SnapshotTaken => Some(Self::EnvironmentValidated),
            Self::EnvironmentValidated => Some(Self::SyntaxChecked),
            Self::SyntaxChecked => Some(Self::Applied),
            Self::Applied => Some(Self::Tested),
            Self::Tested => Some(Self::Committed),
            Self::Committed | Self::RolledBack | Self::FailedUnrecoverable => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::RolledBack | Self::FailedUnrecoverable
        )
    }

    /// True once a snapshot exists and the attempt has not ended.
    pub fn has_recovery_point(self) -> bool {
        !self.is_terminal() && self != Self::Idle
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::SnapshotTaken => "snapshot_taken",
            Self::EnvironmentValidated => "environment_validated",
            Self::SyntaxChecked => "syntax_checked",
            Self::Applied => "applied",
            Self::Tested => "tested",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::FailedUnrecoverable => "failed_unrecoverable",
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol step, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Snapshot,
    Environment,
    SyntaxCheck,
    Apply,
    Test,
    Commit,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Environment => "environment validation",
            Self::SyntaxCheck => "syntax check",
            Self::Apply => "apply",
            Self::Test => "test",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: ProtocolState,
    pub to: ProtocolState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal protocol transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: ProtocolState,
    pub to: ProtocolState,
}

/// Tracks the current state of one attempt and every transition taken.
#[derive(Debug, Clone)]
pub struct ProtocolMachine {
    state: ProtocolState,
    transitions: Vec<Transition>,
}

impl Default for ProtocolMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolMachine {
    pub fn new() -> Self {
        Self {
            state: ProtocolState::Idle,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<Transition> {
        self.transitions
    }

    /// Move along the happy path. `to` must be the successor of the current state.
    pub fn advance_to(&mut self, to: ProtocolState) -> Result<(), IllegalTransition> {
        if self.state.successor() != Some(to) {
            return Err(self.illegal(to));
        }
        self.record(to, None);
        Ok(())
    }

    /// Record a completed restore.
    pub fn roll_back(&mut self, reason: impl Into<String>) -> Result<(), IllegalTransition> {
        if !self.state.has_recovery_point() {
            return Err(self.illegal(ProtocolState::RolledBack));
        }
        self.record(ProtocolState::RolledBack, Some(reason.into()));
        Ok(())
    }

    /// Record a failure that left the working tree in an unknown state.
    pub fn fail_unrecoverable(
        &mut self,
        reason: impl Into<String>,
    ) -> Result<(), IllegalTransition> {
        if self.state.is_terminal() {
            return Err(self.illegal(ProtocolState::FailedUnrecoverable));
        }
        self.record(ProtocolState::FailedUnrecoverable, Some(reason.into()));
        Ok(())
    }

    fn record(&mut self, to: ProtocolState, reason: Option<String>) {
        self.transitions.push(Transition {
            from: self.state,
            to,
            reason,
        });
        self.state = to;
    }

    fn illegal(&self, to: ProtocolState) -> IllegalTransition {
        IllegalTransition {
            from: self.state,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_at(target: ProtocolState) -> ProtocolMachine {
        let mut machine = ProtocolMachine::new();
        while machine.state() != target {
            let next = machine.state().successor().expect("successor");
            machine.advance_to(next).expect("advance");
        }
        machine
    }

    #[test]
    fn happy_path_reaches_committed() {
        let machine = machine_at(ProtocolState::Committed);
        let visited: Vec<ProtocolState> = machine.transitions().iter().map(|t| t.to).collect();
        assert_eq!(
            visited,
            vec![
                ProtocolState::SnapshotTaken,
                ProtocolState::EnvironmentValidated,
                ProtocolState::SyntaxChecked,
                ProtocolState::Applied,
                ProtocolState::Tested,
                ProtocolState::Committed,
            ]
        );
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn skipping_a_step_is_rejected() {
        let mut machine = machine_at(ProtocolState::SnapshotTaken);
        let err = machine
            .advance_to(ProtocolState::Applied)
            .expect_err("skip must fail");
        assert_eq!(err.from, ProtocolState::SnapshotTaken);
        assert_eq!(machine.state(), ProtocolState::SnapshotTaken);
    }

    #[test]
    fn every_state_after_snapshot_can_roll_back() {
        for state in [
            ProtocolState::SnapshotTaken,
            ProtocolState::EnvironmentValidated,
            ProtocolState::SyntaxChecked,
            ProtocolState::Applied,
            ProtocolState::Tested,
        ] {
            let mut machine = machine_at(state);
            machine.roll_back("boom").expect("roll back");
            let last = machine.transitions().last().expect("transition");
            assert_eq!(last.from, state);
            assert_eq!(last.to, ProtocolState::RolledBack);
            assert_eq!(last.reason.as_deref(), Some("boom"));
        }
    }

    #[test]
    fn idle_cannot_roll_back() {
        let mut machine = ProtocolMachine::new();
        assert!(machine.roll_back("no snapshot").is_err());
        machine
            .fail_unrecoverable("snapshot failed")
            .expect("idle may fail");
        assert_eq!(machine.state(), ProtocolState::FailedUnrecoverable);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut machine = machine_at(ProtocolState::Committed);
        assert!(machine.roll_back("late").is_err());
        assert!(machine.fail_unrecoverable("late").is_err());

        let mut machine = machine_at(ProtocolState::Applied);
        machine.roll_back("tests failed").expect("roll back");
        assert!(machine.advance_to(ProtocolState::Tested).is_err());
    }
}
