//! Dry-run syntax check of a diff in a throwaway scratch repository.
//!
//! The scratch directory is seeded with the current content of every file the diff reads, the
//! diff is applied there, and every file the diff produces is parsed. The real working tree is
//! only ever read.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::diff::{FilePatch, parse_file_patches};
use crate::core::source_check::{SourceKind, check_source};
use crate::core::state::Step;
use crate::core::types::{ChangeFailure, SyntaxReport};
use crate::io::config::ChangeguardConfig;
use crate::io::git::Git;
use crate::io::tool::ToolRunner;

pub struct SyntaxValidator<'a, R: ToolRunner> {
    runner: &'a R,
    workdir: PathBuf,
    cfg: &'a ChangeguardConfig,
}

impl<'a, R: ToolRunner> SyntaxValidator<'a, R> {
    pub fn new(runner: &'a R, workdir: &Path, cfg: &'a ChangeguardConfig) -> Self {
        Self {
            runner,
            workdir: workdir.to_path_buf(),
            cfg,
        }
    }

    /// Apply `diff` to a scratch copy and parse every file it touches.
    ///
    /// Empty, malformed or path-escaping diffs, diffs that do not apply, and parse errors are
    /// all [`ChangeFailure::Syntax`].
    #[instrument(skip_all, fields(diff_bytes = diff.len()))]
    pub fn check(&self, diff: &str) -> Result<SyntaxReport, ChangeFailure> {
        let patches = parse_file_patches(diff).map_err(|err| ChangeFailure::syntax(err.to_string()))?;
        debug!(files = patches.len(), "diff parsed");

        let scratch = tempfile::Builder::new()
            .prefix("changeguard-syntax-")
            .tempdir()
            .context("create scratch directory")
            .map_err(|err| ChangeFailure::unexpected(Step::SyntaxCheck, &err))?;

        self.seed(scratch.path(), &patches)
            .map_err(|err| ChangeFailure::unexpected(Step::SyntaxCheck, &err))?;

        let git = Git::from_config(self.runner, scratch.path(), self.cfg);
        git.init()
            .map_err(|err| ChangeFailure::unexpected(Step::SyntaxCheck, &err))?;
        let output = git
            .apply(diff)
            .map_err(|err| ChangeFailure::unexpected(Step::SyntaxCheck, &err))?;
        if !output.success() {
            return Err(ChangeFailure::syntax(format!(
                "diff does not apply: {}",
                output.diagnostic()
            )));
        }

        let report = parse_post_images(scratch.path(), &patches)?;
        info!(
            checked = report.checked.len(),
            unchecked = report.unchecked.len(),
            "syntax check passed"
        );
        Ok(report)
    }

    /// Copy the pre-image of every modified, deleted or renamed file into `scratch`.
    ///
    /// Missing pre-images are left out; `git apply` then reports the mismatch.
    fn seed(&self, scratch: &Path, patches: &[FilePatch]) -> Result<()> {
        for rel in patches.iter().filter_map(FilePatch::pre_image) {
            let src = self.workdir.join(rel);
            if !src.is_file() {
                debug!(path = rel, "pre-image missing in working tree");
                continue;
            }
            let dst = scratch.join(rel);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            fs::copy(&src, &dst)
                .with_context(|| format!("copy {} -> {}", src.display(), dst.display()))?;
        }
        Ok(())
    }
}

fn parse_post_images(scratch: &Path, patches: &[FilePatch]) -> Result<SyntaxReport, ChangeFailure> {
    let mut report = SyntaxReport::default();
    for patch in patches {
        let Some(rel) = patch.post_image() else {
            continue;
        };
        let kind = match SourceKind::from_path(Path::new(rel)) {
            Some(kind) if !patch.binary => kind,
            _ => {
                report.unchecked.push(rel.to_string());
                continue;
            }
        };
        let path = scratch.join(rel);
        let source = fs::read_to_string(&path)
            .with_context(|| format!("read {rel} after apply"))
            .map_err(|err| ChangeFailure::unexpected(Step::SyntaxCheck, &err))?;
        check_source(kind, &source).map_err(|err| {
            ChangeFailure::syntax(format!("Syntax errors detected in {rel}:{err}"))
        })?;
        report.checked.push(rel.to_string());
    }
    Ok(report)
}
