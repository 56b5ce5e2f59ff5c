//! Stable exit codes for changeguard CLI commands.

use crate::core::types::ChangeStatus;

/// Command succeeded; for `apply`, the change was applied, tested and committed.
pub const OK: i32 = 0;
/// Invalid invocation, config or proposal, or the environment check found problems.
pub const INVALID: i32 = 1;
/// `apply` failed a step and the working tree was restored.
pub const ROLLED_BACK: i32 = 2;
/// `apply` or `snapshot restore` could not restore the working tree.
pub const FAILED: i32 = 3;

pub fn for_status(status: ChangeStatus) -> i32 {
    match status {
        ChangeStatus::Success => OK,
        ChangeStatus::RolledBack => ROLLED_BACK,
        ChangeStatus::Failed => FAILED,
    }
}
