//! Tree copy and cleanup used by snapshots.
//!
//! Two backends produce the same result: `rsync -a` run through the [`ToolRunner`], or an
//! in-process walk. Both skip excluded paths and preserve symlinks as links.

use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::core::exclude::ExcludeRules;
use crate::io::config::{ChangeguardConfig, SyncBackend};
use crate::io::tool::{ToolRequest, ToolRunner};

/// Copies trees with the configured backend.
#[derive(Debug, Clone)]
pub struct TreeSync<'a, R: ToolRunner> {
    runner: &'a R,
    backend: SyncBackend,
    rsync_program: String,
    timeout: std::time::Duration,
    output_limit_bytes: usize,
}

impl<'a, R: ToolRunner> TreeSync<'a, R> {
    pub fn from_config(runner: &'a R, cfg: &ChangeguardConfig) -> Self {
        Self {
            runner,
            backend: cfg.sync.backend,
            rsync_program: cfg.tools.rsync.program.clone(),
            timeout: cfg.tool_timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }

    /// Copy the contents of `src` into `dst` (created if missing), skipping excluded paths.
    ///
    /// Existing files in `dst` are overwritten; nothing in `dst` is deleted.
    #[instrument(skip_all, fields(backend = ?self.backend, src = %src.display(), dst = %dst.display()))]
    pub fn copy_tree(&self, src: &Path, dst: &Path, rules: &ExcludeRules) -> Result<()> {
        fs::create_dir_all(dst).with_context(|| format!("create directory {}", dst.display()))?;
        match self.backend {
            SyncBackend::Rsync => self.rsync(src, dst, rules),
            SyncBackend::Native => copy_tree_native(src, dst, rules),
        }
    }

    fn rsync(&self, src: &Path, dst: &Path, rules: &ExcludeRules) -> Result<()> {
        let mut args = vec!["-a".to_string()];
        for pattern in rules.rsync_patterns() {
            args.push("--exclude".to_string());
            args.push(pattern);
        }
        args.push(format!("{}/", src.display()));
        args.push(format!("{}/", dst.display()));

        let request = ToolRequest::new(&self.rsync_program, src)
            .args(args)
            .timeout(self.timeout)
            .output_limit(self.output_limit_bytes);
        let output = self.runner.run(&request)?;
        if output.timed_out {
            return Err(anyhow!(
                "{} timed out after {}s",
                self.rsync_program,
                self.timeout.as_secs()
            ));
        }
        if !output.success() {
            return Err(anyhow!(
                "{} failed: {}",
                self.rsync_program,
                output.diagnostic()
            ));
        }
        Ok(())
    }
}

/// In-process copy with the same semantics as `rsync -a --exclude ...`.
pub fn copy_tree_native(src: &Path, dst: &Path, rules: &ExcludeRules) -> Result<()> {
    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(src)
                .map(|rel| !rules.is_excluded(rel))
                .unwrap_or(false)
        });

    let mut copied = 0usize;
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("create directory {}", target.display()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        remove_existing(&target)?;
        if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("copy {} -> {}", entry.path().display(), target.display())
            })?;
        }
        copied += 1;
    }
    debug!(copied, "native copy finished");
    Ok(())
}

/// Delete every non-excluded entry under `root`, keeping `root` itself.
///
/// Directories that still hold excluded entries are kept.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn clear_tree(root: &Path, rules: &ExcludeRules) -> Result<()> {
    clear_dir(root, root, rules)
}

fn clear_dir(root: &Path, dir: &Path, rules: &ExcludeRules) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read directory {}", dir.display()))?;
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .with_context(|| format!("relativize {}", path.display()))?;
        if rules.is_excluded(rel) {
            continue;
        }
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", path.display()))?;
        if file_type.is_dir() {
            clear_dir(root, &path, rules)?;
            match fs::remove_dir(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::DirectoryNotEmpty => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("remove {}", path.display()));
                }
            }
        } else {
            fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        }
    }
    Ok(())
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))
        }
        Ok(_) => fs::remove_file(path).with_context(|| format!("remove {}", path.display())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
    }
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = fs::read_link(src).with_context(|| format!("read link {}", src.display()))?;
    std::os::unix::fs::symlink(&target, dst)
        .with_context(|| format!("create link {}", dst.display()))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst).with_context(|| format!("copy {} -> {}", src.display(), dst.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tool::ToolOutput;
    use crate::test_support::ScriptedToolRunner;

    fn rules() -> ExcludeRules {
        ExcludeRules::new([".git", "__pycache__"]).with_anchored(".changeguard")
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn native_copy_skips_excluded_paths() {
        let src = tempfile::tempdir().expect("tempdir");
        let dst = tempfile::tempdir().expect("tempdir");
        write(src.path(), "src/app.py", "x = 1\n");
        write(src.path(), "src/__pycache__/app.pyc", "bytecode");
        write(src.path(), ".git/HEAD", "ref");
        write(src.path(), ".changeguard/config.toml", "");

        copy_tree_native(src.path(), dst.path(), &rules()).expect("copy");

        assert_eq!(
            fs::read_to_string(dst.path().join("src/app.py")).expect("read"),
            "x = 1\n"
        );
        assert!(!dst.path().join("src/__pycache__").exists());
        assert!(!dst.path().join(".git").exists());
        assert!(!dst.path().join(".changeguard").exists());
    }

    #[cfg(unix)]
    #[test]
    fn native_copy_preserves_symlinks() {
        let src = tempfile::tempdir().expect("tempdir");
        let dst = tempfile::tempdir().expect("tempdir");
        write(src.path(), "real.txt", "data");
        std::os::unix::fs::symlink("real.txt", src.path().join("link.txt")).expect("symlink");

        copy_tree_native(src.path(), dst.path(), &rules()).expect("copy");

        let link = fs::read_link(dst.path().join("link.txt")).expect("read link");
        assert_eq!(link, Path::new("real.txt"));
    }

    #[test]
    fn clear_tree_keeps_excluded_entries() {
        let temp = tempfile::tempdir().expect("tempdir");
        write(temp.path(), "src/app.py", "x");
        write(temp.path(), "src/__pycache__/app.pyc", "b");
        write(temp.path(), "docs/readme.md", "d");
        write(temp.path(), ".git/HEAD", "ref");

        clear_tree(temp.path(), &rules()).expect("clear");

        assert!(!temp.path().join("src/app.py").exists());
        assert!(!temp.path().join("docs").exists());
        assert!(temp.path().join("src/__pycache__/app.pyc").exists());
        assert!(temp.path().join(".git/HEAD").exists());
    }

    #[test]
    fn rsync_backend_passes_excludes_and_trailing_slashes() {
        let src = tempfile::tempdir().expect("tempdir");
        let dst = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedToolRunner::new().on("rsync", &["-a"], ToolOutput::ok(""));
        let cfg = ChangeguardConfig::default();
        TreeSync::from_config(&runner, &cfg)
            .copy_tree(src.path(), dst.path(), &rules())
            .expect("copy");

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        let args = &calls[0].args;
        assert_eq!(
            &args[..7],
            &["-a", "--exclude", ".git", "--exclude", "__pycache__", "--exclude", "/.changeguard"]
        );
        assert_eq!(args[7], format!("{}/", src.path().display()));
        assert_eq!(args[8], format!("{}/", dst.path().display()));
    }

    #[test]
    fn rsync_failure_is_an_error() {
        let src = tempfile::tempdir().expect("tempdir");
        let dst = tempfile::tempdir().expect("tempdir");
        let runner =
            ScriptedToolRunner::new().on("rsync", &["-a"], ToolOutput::failed(23, "partial transfer"));
        let cfg = ChangeguardConfig::default();
        let err = TreeSync::from_config(&runner, &cfg)
            .copy_tree(src.path(), dst.path(), &rules())
            .unwrap_err();
        assert!(err.to_string().contains("partial transfer"));
    }
}
