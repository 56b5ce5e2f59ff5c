//! Applies a diff to the real working tree.

use std::path::Path;

use tracing::{info, instrument};

use crate::core::state::Step;
use crate::core::types::ChangeFailure;
use crate::io::config::ChangeguardConfig;
use crate::io::git::Git;
use crate::io::tool::ToolRunner;

pub struct ChangeApplier<'a, R: ToolRunner> {
    git: Git<'a, R>,
}

impl<'a, R: ToolRunner> ChangeApplier<'a, R> {
    pub fn new(runner: &'a R, workdir: &Path, cfg: &ChangeguardConfig) -> Self {
        Self {
            git: Git::from_config(runner, workdir, cfg),
        }
    }

    /// `git apply --check` then `git apply`.
    ///
    /// The check catches most rejections before anything is written. If the real apply still
    /// fails halfway, the snapshot restore cleans up.
    #[instrument(skip_all, fields(diff_bytes = diff.len()))]
    pub fn apply(&self, diff: &str) -> Result<(), ChangeFailure> {
        let unexpected = |err: anyhow::Error| ChangeFailure::unexpected(Step::Apply, &err);

        let check = self.git.apply_check(diff).map_err(unexpected)?;
        if !check.success() {
            return Err(ChangeFailure::apply(format!(
                "diff does not apply cleanly: {}",
                check.diagnostic()
            )));
        }

        let applied = self.git.apply(diff).map_err(unexpected)?;
        if !applied.success() {
            return Err(ChangeFailure::apply(applied.diagnostic()));
        }
        info!("diff applied to working tree");
        Ok(())
    }
}
