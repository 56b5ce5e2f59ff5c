//! Atomic change protocol for applying source changes to a git working tree.
//!
//! A change proposal carries a unified diff and a test command. The protocol takes a verified
//! snapshot of the tree, checks the environment, dry-runs the diff and parses the touched
//! files, applies it, runs the tests and commits. Any failure after the snapshot restores the
//! tree from it. The layering:
//!
//! - **[`core`]**: Pure logic (state machine, diff parsing, exclusions, source parsing).
//!   No I/O.
//! - **[`io`]**: Side effects (filesystem, git, process execution), all process launches
//!   going through [`io::tool::ToolRunner`] so tests can script them.
//!
//! [`protocol`] composes both into [`protocol::Orchestrator::atomic_change`].

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod protocol;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
