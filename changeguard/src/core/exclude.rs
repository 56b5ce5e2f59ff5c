//! Path exclusion rules shared by snapshot copies, checksums and restores.
//!
//! An excluded path is invisible to the protocol: it is not copied into a backup, not hashed,
//! and not deleted when a backup is restored.

use std::path::{Component, Path, PathBuf};

/// Exclusion rules, written in a subset of rsync's `--exclude` syntax:
///
/// - `name`: any path component equal to `name` (`.git`, `__pycache__`).
/// - `*.ext`: any component ending in `.ext` (`*.pyc`).
/// - `/rel/path`: one path relative to the tree root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeRules {
    names: Vec<String>,
    suffixes: Vec<String>,
    anchored: Vec<PathBuf>,
}

impl ExcludeRules {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Self::default();
        for pattern in patterns {
            rules.push(pattern.as_ref());
        }
        rules
    }

    /// Exclude one root-relative path (used for the state dir and backup root).
    pub fn with_anchored(mut self, rel: impl AsRef<Path>) -> Self {
        let rel = normalize(rel.as_ref());
        if !rel.as_os_str().is_empty() && !self.anchored.contains(&rel) {
            self.anchored.push(rel);
        }
        self
    }

    fn push(&mut self, pattern: &str) {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return;
        }
        if let Some(anchored) = pattern.strip_prefix('/') {
            let rel = normalize(Path::new(anchored.trim_end_matches('/')));
            if !rel.as_os_str().is_empty() {
                self.anchored.push(rel);
            }
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.suffixes.push(suffix.to_string());
        } else {
            self.names.push(pattern.trim_end_matches('/').to_string());
        }
    }

    /// True if `rel` (relative to the tree root) or any of its parents is excluded.
    pub fn is_excluded(&self, rel: &Path) -> bool {
        let rel = normalize(rel);
        if self.anchored.iter().any(|anchored| rel.starts_with(anchored)) {
            return true;
        }
        rel.components().any(|component| match component {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                self.names.iter().any(|n| *n == name)
                    || self.suffixes.iter().any(|s| name.ends_with(s.as_str()))
            }
            _ => false,
        })
    }

    /// Render as rsync `--exclude` patterns.
    pub fn rsync_patterns(&self) -> Vec<String> {
        let mut patterns = Vec::new();
        patterns.extend(self.names.iter().cloned());
        patterns.extend(self.suffixes.iter().map(|s| format!("*{s}")));
        patterns.extend(
            self.anchored
                .iter()
                .map(|p| format!("/{}", p.to_string_lossy().replace('\\', "/"))),
        );
        patterns
    }

    /// Render as git `:(exclude)` pathspecs, so staging skips whatever snapshots skip.
    ///
    /// Glob pathspecs do not match the contents of a matched directory, hence the `/**` twin.
    pub fn git_exclude_pathspecs(&self) -> Vec<String> {
        let mut pathspecs = Vec::new();
        for name in &self.names {
            pathspecs.push(format!(":(exclude,glob)**/{name}"));
            pathspecs.push(format!(":(exclude,glob)**/{name}/**"));
        }
        for suffix in &self.suffixes {
            pathspecs.push(format!(":(exclude,glob)**/*{suffix}"));
            pathspecs.push(format!(":(exclude,glob)**/*{suffix}/**"));
        }
        pathspecs.extend(
            self.anchored
                .iter()
                .map(|p| format!(":(exclude){}", p.to_string_lossy().replace('\\', "/"))),
        );
        pathspecs
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .collect()
}
