//! Shared types for the atomic change protocol.
//!
//! These types define stable contracts between the orchestrator, its steps and the caller.
//! They do not depend on external state or I/O.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::state::{ProtocolState, Step, Transition};

/// A proposed source change. Produced by an external generator, consumed once.
///
/// The original field names (`proposal_id`, `target_component`, `estimated_difficulty`,
/// `test_plan`) are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeProposal {
    #[serde(alias = "proposal_id")]
    pub id: String,
    pub title: String,
    /// Path of the component the change targets.
    #[serde(alias = "target_component")]
    pub target: String,
    pub impact_justification: String,
    #[serde(alias = "estimated_difficulty")]
    pub difficulty: String,
    /// Unified diff text.
    pub diff_content: String,
    #[serde(alias = "test_plan")]
    pub test_command: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

/// Final outcome category of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Change applied, tested and (best effort) committed.
    Success,
    /// A step failed and the working tree was restored from the snapshot.
    RolledBack,
    /// Recovery could not be completed. The working tree needs manual attention.
    Failed,
}

impl ChangeStatus {
    /// True when the working tree is in a known, consistent state.
    pub fn is_handled(self) -> bool {
        !matches!(self, Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant of [`ChangeFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Environment,
    Syntax,
    Apply,
    Test,
    Unexpected,
    Rollback,
}

/// Why an attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeFailure {
    #[error("environment validation failed: {detail}")]
    Environment { detail: String },
    #[error("syntax check failed: {detail}")]
    Syntax { detail: String },
    #[error("apply failed: {detail}")]
    Apply { detail: String },
    #[error("tests failed: {detail}")]
    Test { detail: String },
    #[error("unexpected error during {step}: {detail}")]
    Unexpected { step: Step, detail: String },
    #[error("rollback failed: {detail}")]
    Rollback { detail: String },
}

impl ChangeFailure {
    pub fn environment(detail: impl Into<String>) -> Self {
        Self::Environment {
            detail: detail.into(),
        }
    }

    pub fn syntax(detail: impl Into<String>) -> Self {
        Self::Syntax {
            detail: detail.into(),
        }
    }

    pub fn apply(detail: impl Into<String>) -> Self {
        Self::Apply {
            detail: detail.into(),
        }
    }

    pub fn test(detail: impl Into<String>) -> Self {
        Self::Test {
            detail: detail.into(),
        }
    }

    pub fn rollback(detail: impl Into<String>) -> Self {
        Self::Rollback {
            detail: detail.into(),
        }
    }

    /// Wrap a plumbing error raised while running `step`.
    pub fn unexpected(step: Step, err: &anyhow::Error) -> Self {
        Self::Unexpected {
            step,
            detail: format!("{err:#}"),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Environment { .. } => FailureKind::Environment,
            Self::Syntax { .. } => FailureKind::Syntax,
            Self::Apply { .. } => FailureKind::Apply,
            Self::Test { .. } => FailureKind::Test,
            Self::Unexpected { .. } => FailureKind::Unexpected,
            Self::Rollback { .. } => FailureKind::Rollback,
        }
    }
}

/// Metadata for a full-tree backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    /// Working tree the backup was taken from.
    pub source_path: PathBuf,
    /// Directory holding the tree copy.
    pub backup_path: PathBuf,
    pub file_count: u64,
    /// Hex SHA-256 over the tree, see [`crate::io::checksum`].
    pub checksum: String,
}

/// Classification of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestVerdict {
    Passed,
    Failed,
    TimedOut,
}

/// Result of running a proposal's declared test command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub verdict: TestVerdict,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Human-readable reason when the verdict is not `Passed`.
    pub failure_reason: Option<String>,
    pub duration_ms: u64,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.verdict == TestVerdict::Passed
    }
}

/// What the commit step managed to record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommitRecord {
    Committed { sha: String },
    NothingToCommit,
    Failed { reason: String },
}

/// Files inspected by the syntax dry run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxReport {
    /// Paths that were parsed successfully.
    pub checked: Vec<String>,
    /// Paths with no registered parser.
    pub unchecked: Vec<String>,
}

/// Everything the caller learns about one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeOutcome {
    pub proposal_id: String,
    pub status: ChangeStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ChangeFailure>,
    pub state: ProtocolState,
    pub transitions: Vec<Transition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syntax: Option<SyntaxReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitRecord>,
}

impl ChangeOutcome {
    /// The `(status, message)` pair handed to audit loggers.
    pub fn into_pair(self) -> (ChangeStatus, String) {
        (self.status, self.message)
    }
}
