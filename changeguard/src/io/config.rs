//! Changeguard configuration stored under `.changeguard/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::exclude::ExcludeRules;
use crate::core::version::Version;

/// Default location of the state dir, relative to the working tree.
pub const DEFAULT_STATE_DIR: &str = ".changeguard";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Changeguard configuration (TOML).
///
/// Missing fields default to values suited to a Python project tested with `pytest`, which is
/// what the protocol was first built for. Every path is relative to the working tree unless
/// absolute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChangeguardConfig {
    /// Directory for changeguard's own files (config, lock). Never snapshotted or restored.
    pub state_dir: PathBuf,

    /// Directory holding snapshot backups and their metadata.
    pub backup_root: PathBuf,

    /// Wall-clock budget for each git or rsync invocation and tool check.
    pub tool_timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    pub test: TestConfig,
    pub sync: SyncConfig,
    pub tools: ToolsConfig,
    pub environment: EnvironmentConfig,
    pub commit: CommitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestConfig {
    /// Hard timeout for the declared test command.
    pub timeout_secs: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5 * 60,
        }
    }
}

/// How snapshot trees are copied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncBackend {
    /// `rsync -a` through the tool runner.
    Rsync,
    /// In-process recursive copy.
    Native,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    pub backend: SyncBackend,
    /// Paths invisible to snapshots, checksums and restores (see [`ExcludeRules`]).
    pub exclude: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend: SyncBackend::Rsync,
            exclude: [
                ".git",
                "__pycache__",
                "*.pyc",
                ".pytest_cache",
                "target",
                "node_modules",
                ".venv",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// An external program plus the arguments used to check it is usable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolSpec {
    pub program: String,
    pub check_args: Vec<String>,
}

impl ToolSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            ..Self::default()
        }
    }
}

impl Default for ToolSpec {
    fn default() -> Self {
        Self {
            program: String::new(),
            check_args: vec!["--version".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    pub git: ToolSpec,
    pub rsync: ToolSpec,
    /// The only program a proposal's test command may invoke.
    pub test_runner: ToolSpec,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            git: ToolSpec::new("git"),
            rsync: ToolSpec::new("rsync"),
            test_runner: ToolSpec::new("pytest"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Refuse to start when the tree has uncommitted changes outside the state dir.
    pub require_clean_tree: bool,
    pub check_runtime: bool,
    pub runtime: RuntimeRequirement,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            require_clean_tree: true,
            check_runtime: true,
            runtime: RuntimeRequirement::default(),
        }
    }
}

/// Minimum version of the host runtime the tests run on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeRequirement {
    pub program: String,
    pub check_args: Vec<String>,
    pub min_version: String,
}

impl Default for RuntimeRequirement {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            check_args: vec!["--version".to_string()],
            min_version: "3.8".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommitConfig {
    /// minijinja template; `id`, `title` and `target` are in scope.
    pub message_template: String,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            message_template: "{{ id }}: {{ title }}\n\nApplied by changeguard atomic change protocol"
                .to_string(),
        }
    }
}

impl Default for ChangeguardConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            backup_root: Path::new(DEFAULT_STATE_DIR).join("snapshots"),
            tool_timeout_secs: 60,
            output_limit_bytes: 100_000,
            test: TestConfig::default(),
            sync: SyncConfig::default(),
            tools: ToolsConfig::default(),
            environment: EnvironmentConfig::default(),
            commit: CommitConfig::default(),
        }
    }
}

impl ChangeguardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(anyhow!("state_dir must not be empty"));
        }
        if self.backup_root.as_os_str().is_empty() {
            return Err(anyhow!("backup_root must not be empty"));
        }
        if self.tool_timeout_secs == 0 {
            return Err(anyhow!("tool_timeout_secs must be > 0"));
        }
        if self.test.timeout_secs == 0 {
            return Err(anyhow!("test.timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        for (name, spec) in [
            ("tools.git", &self.tools.git),
            ("tools.rsync", &self.tools.rsync),
            ("tools.test_runner", &self.tools.test_runner),
        ] {
            if spec.program.trim().is_empty() {
                return Err(anyhow!("{name}.program must be non-empty"));
            }
        }
        if self.environment.check_runtime {
            if self.environment.runtime.program.trim().is_empty() {
                return Err(anyhow!("environment.runtime.program must be non-empty"));
            }
            self.environment
                .runtime
                .min_version
                .parse::<Version>()
                .map_err(|err| anyhow!("environment.runtime.min_version: {err}"))?;
        }
        let templates = minijinja::Environment::new();
        templates
            .template_from_str(&self.commit.message_template)
            .map_err(|err| anyhow!("commit.message_template: {err}"))?;
        Ok(())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test.timeout_secs)
    }

    pub fn state_dir_in(&self, workdir: &Path) -> PathBuf {
        workdir.join(&self.state_dir)
    }

    pub fn backup_root_in(&self, workdir: &Path) -> PathBuf {
        workdir.join(&self.backup_root)
    }

    /// Root-relative prefixes owned by changeguard (state dir, backup root when inside the tree).
    pub fn owned_prefixes(&self, workdir: &Path) -> Vec<PathBuf> {
        let mut prefixes = Vec::new();
        for path in [self.state_dir_in(workdir), self.backup_root_in(workdir)] {
            if let Ok(rel) = path.strip_prefix(workdir)
                && !rel.as_os_str().is_empty()
                && !prefixes.iter().any(|p: &PathBuf| rel.starts_with(p))
            {
                prefixes.push(rel.to_path_buf());
            }
        }
        prefixes
    }

    /// Exclusion rules for a working tree: the configured patterns plus changeguard's own dirs.
    pub fn exclude_rules(&self, workdir: &Path) -> ExcludeRules {
        self.owned_prefixes(workdir)
            .into_iter()
            .fold(ExcludeRules::new(&self.sync.exclude), |rules, rel| {
                rules.with_anchored(rel)
            })
    }
}

/// Default config path for a working tree.
pub fn default_config_path(workdir: &Path) -> PathBuf {
    workdir.join(DEFAULT_STATE_DIR).join(CONFIG_FILE_NAME)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ChangeguardConfig::default()`.
pub fn load_config(path: &Path) -> Result<ChangeguardConfig> {
    if !path.exists() {
        let cfg = ChangeguardConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ChangeguardConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ChangeguardConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
