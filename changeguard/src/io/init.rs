//! Scaffolding for the `.changeguard/` state dir.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{CONFIG_FILE_NAME, ChangeguardConfig, DEFAULT_STATE_DIR, write_config};
use super::lock::LOCK_FILE_NAME;

/// Canonical paths within the state dir of a working tree.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub lock_path: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(DEFAULT_STATE_DIR);
        Self {
            root,
            gitignore_path: state_dir.join(".gitignore"),
            config_path: state_dir.join(CONFIG_FILE_NAME),
            lock_path: state_dir.join(LOCK_FILE_NAME),
            state_dir,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config.
    pub force: bool,
}

/// Create `.changeguard/` with a default config in `root`.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_state_dir(root: &Path, options: &InitOptions) -> Result<StatePaths> {
    let paths = StatePaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "changeguard init: {DEFAULT_STATE_DIR} exists but is not a directory"
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "changeguard init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create directory {}", paths.state_dir.display()))?;
    fs::write(&paths.gitignore_path, STATE_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &ChangeguardConfig::default())?;

    Ok(paths)
}

/// Lock and backups stay out of history; the config may be committed.
const STATE_GITIGNORE: &str = "lock\nsnapshots/\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_config_and_gitignore() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_state_dir(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.state_dir.is_dir());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            STATE_GITIGNORE
        );
        assert_eq!(
            load_config(&paths.config_path).expect("load"),
            ChangeguardConfig::default()
        );
    }

    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_state_dir(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_state_dir(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_restores_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_state_dir(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "tool_timeout_secs = 5\n").expect("write custom");

        init_state_dir(temp.path(), &InitOptions { force: true }).expect("re-init");

        let cfg = load_config(&paths.config_path).expect("load");
        assert_eq!(cfg.tool_timeout_secs, 60);
    }
}
