//! Single-writer lock on a working tree.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

pub const LOCK_FILE_NAME: &str = "lock";

/// Exclusive lock held as `<state_dir>/lock`. Released on drop.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    /// Create the lock file, failing if another process holds it.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("create directory {}", state_dir.display()))?;
        let path = state_dir.join(LOCK_FILE_NAME);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                return Err(anyhow!(
                    "another changeguard run holds {} (pid {}); remove it if that run is gone",
                    path.display(),
                    non_empty(holder.trim())
                ));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("create lock {}", path.display()));
            }
        };
        let lock = Self { path };
        writeln!(file, "{}", std::process::id())
            .with_context(|| format!("write lock {}", lock.path.display()))?;
        debug!(path = %lock.path.display(), "lock acquired");
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(err = %err, path = %self.path.display(), "failed to release lock");
        }
    }
}

fn non_empty(value: &str) -> &str {
    if value.is_empty() { "unknown" } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state_dir = temp.path().join(".changeguard");

        let lock = StateLock::acquire(&state_dir).expect("acquire");
        let pid = fs::read_to_string(lock.path()).expect("read");
        assert_eq!(pid.trim(), std::process::id().to_string());

        let err = StateLock::acquire(&state_dir).unwrap_err();
        assert!(err.to_string().contains("another changeguard run"));

        drop(lock);
        assert!(!state_dir.join(LOCK_FILE_NAME).exists());
        StateLock::acquire(&state_dir).expect("reacquire");
    }
}
