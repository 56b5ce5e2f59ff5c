//! Unified diff inspection.
//!
//! The VCS client applies diffs; this module only works out which files a diff reads and
//! writes, and refuses diffs that reach outside the working tree. Hunk bodies are skipped by
//! counting lines from the `@@` header, so removed lines that start with `---` are not
//! mistaken for file headers.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

static HUNK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -\d+(?:,(\d+))? \+\d+(?:,(\d+))? @@").expect("hunk header regex")
});

/// How a diff changes a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// Per-file section of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub kind: PatchKind,
    pub binary: bool,
}

impl FilePatch {
    /// Path that must already exist for the patch to apply.
    pub fn pre_image(&self) -> Option<&str> {
        match self.kind {
            PatchKind::Added => None,
            _ => self.old_path.as_deref(),
        }
    }

    /// Path that exists once the patch is applied.
    pub fn post_image(&self) -> Option<&str> {
        match self.kind {
            PatchKind::Deleted => None,
            _ => self.new_path.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("diff is empty")]
    Empty,
    #[error("diff contains no file changes")]
    NoFiles,
    #[error("malformed diff at line {line}: {message}")]
    Malformed { line: usize, message: String },
    #[error("unsafe path '{0}' (must be relative and stay inside the working tree)")]
    UnsafePath(String),
}

#[derive(Debug, Default)]
struct PatchBuilder {
    header_old: Option<String>,
    header_new: Option<String>,
    /// `Some(None)` records an explicit `/dev/null` marker.
    marker_old: Option<Option<String>>,
    marker_new: Option<Option<String>>,
    rename_from: Option<String>,
    rename_to: Option<String>,
    new_file: bool,
    deleted_file: bool,
    binary: bool,
}

impl PatchBuilder {
    fn from_git_header(rest: &str) -> Self {
        let (old, new) = split_git_header(rest);
        Self {
            header_old: old,
            header_new: new,
            ..Self::default()
        }
    }

    fn finish(self) -> Result<FilePatch, DiffError> {
        let old = self
            .rename_from
            .clone()
            .or_else(|| self.marker_old.clone().flatten())
            .or_else(|| self.header_old.clone());
        let new = self
            .rename_to
            .clone()
            .or_else(|| self.marker_new.clone().flatten())
            .or_else(|| self.header_new.clone());

        let kind = if self.new_file || matches!(self.marker_old, Some(None)) {
            PatchKind::Added
        } else if self.deleted_file || matches!(self.marker_new, Some(None)) {
            PatchKind::Deleted
        } else if self.rename_from.is_some() || self.rename_to.is_some() {
            PatchKind::Renamed
        } else {
            PatchKind::Modified
        };

        let (old_path, new_path) = match kind {
            PatchKind::Added => (None, new),
            PatchKind::Deleted => (old, None),
            PatchKind::Modified | PatchKind::Renamed => (old, new),
        };
        for path in old_path.iter().chain(new_path.iter()) {
            ensure_safe_path(path)?;
        }
        if old_path.is_none() && new_path.is_none() {
            return Err(DiffError::NoFiles);
        }
        Ok(FilePatch {
            old_path,
            new_path,
            kind,
            binary: self.binary,
        })
    }
}

/// Parse the per-file sections of a unified (optionally git-extended) diff.
///
/// Fails closed: empty input, input without any file section, hunks without a file header and
/// paths escaping the working tree are all errors.
pub fn parse_file_patches(diff: &str) -> Result<Vec<FilePatch>, DiffError> {
    if diff.trim().is_empty() {
        return Err(DiffError::Empty);
    }

    let mut patches = Vec::new();
    let mut current: Option<PatchBuilder> = None;
    let mut old_remaining = 0usize;
    let mut new_remaining = 0usize;

    for (idx, line) in diff.lines().enumerate() {
        let lineno = idx + 1;

        if old_remaining > 0 || new_remaining > 0 {
            match line.as_bytes().first() {
                // Some tools strip the trailing space of empty context lines.
                None | Some(b' ') => {
                    old_remaining = old_remaining.saturating_sub(1);
                    new_remaining = new_remaining.saturating_sub(1);
                }
                Some(b'-') => old_remaining = old_remaining.saturating_sub(1),
                Some(b'+') => new_remaining = new_remaining.saturating_sub(1),
                Some(b'\\') => {}
                _ => {
                    return Err(DiffError::Malformed {
                        line: lineno,
                        message: "hunk ended before its declared line count".to_string(),
                    });
                }
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(done) = current.take() {
                patches.push(done.finish()?);
            }
            current = Some(PatchBuilder::from_git_header(rest));
        } else if let Some(rest) = line.strip_prefix("--- ") {
            // A `---` marker without a preceding `diff --git` starts a plain unified diff
            // section, as does a second `---` marker.
            let starts_new = current
                .as_ref()
                .is_none_or(|builder| builder.marker_old.is_some());
            if starts_new {
                if let Some(done) = current.take() {
                    patches.push(done.finish()?);
                }
                current = Some(PatchBuilder::default());
            }
            if let Some(builder) = current.as_mut() {
                builder.marker_old = Some(parse_marker(rest));
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let builder = current.as_mut().ok_or_else(|| DiffError::Malformed {
                line: lineno,
                message: "'+++' without a preceding file header".to_string(),
            })?;
            builder.marker_new = Some(parse_marker(rest));
        } else if line.starts_with("@@") {
            let builder = current.as_ref().ok_or_else(|| DiffError::Malformed {
                line: lineno,
                message: "hunk without a file header".to_string(),
            })?;
            if builder.marker_old.is_none() || builder.marker_new.is_none() {
                return Err(DiffError::Malformed {
                    line: lineno,
                    message: "hunk before '---'/'+++' markers".to_string(),
                });
            }
            let caps = HUNK_RE.captures(line).ok_or_else(|| DiffError::Malformed {
                line: lineno,
                message: format!("invalid hunk header '{line}'"),
            })?;
            old_remaining = hunk_count(caps.get(1).map(|m| m.as_str()));
            new_remaining = hunk_count(caps.get(2).map(|m| m.as_str()));
        } else if let Some(builder) = current.as_mut() {
            if line.starts_with("new file mode") {
                builder.new_file = true;
            } else if line.starts_with("deleted file mode") {
                builder.deleted_file = true;
            } else if let Some(path) = line.strip_prefix("rename from ") {
                builder.rename_from = Some(unquote(path));
            } else if let Some(path) = line.strip_prefix("rename to ") {
                builder.rename_to = Some(unquote(path));
            } else if line.starts_with("Binary files ") || line == "GIT binary patch" {
                builder.binary = true;
            }
        }
    }

    if old_remaining > 0 || new_remaining > 0 {
        return Err(DiffError::Malformed {
            line: diff.lines().count(),
            message: "diff ends inside a hunk".to_string(),
        });
    }
    if let Some(done) = current.take() {
        patches.push(done.finish()?);
    }
    if patches.is_empty() {
        return Err(DiffError::NoFiles);
    }
    Ok(patches)
}

fn hunk_count(raw: Option<&str>) -> usize {
    raw.and_then(|count| count.parse().ok()).unwrap_or(1)
}

/// Split `a/<old> b/<new>` from a `diff --git` header.
fn split_git_header(rest: &str) -> (Option<String>, Option<String>) {
    let rest = rest.trim();
    if rest.starts_with('"') {
        let mut parts = rest.splitn(2, "\" ");
        let old = parts.next().map(|p| format!("{p}\""));
        let new = parts.next();
        return (
            old.map(|p| strip_prefix_component(&unquote(&p))),
            new.map(|p| strip_prefix_component(&unquote(p))),
        );
    }
    match rest.find(" b/") {
        Some(idx) => (
            Some(strip_prefix_component(&rest[..idx])),
            Some(strip_prefix_component(&rest[idx + 1..])),
        ),
        None => (None, None),
    }
}

/// Parse a `---`/`+++` marker. `None` means `/dev/null`.
fn parse_marker(rest: &str) -> Option<String> {
    let raw = rest.split('\t').next().unwrap_or(rest).trim_end();
    if raw == "/dev/null" {
        return None;
    }
    Some(strip_prefix_component(&unquote(raw)))
}

/// Drop the leading `a/`-style component, matching `git apply -p1`.
fn strip_prefix_component(path: &str) -> String {
    match path.split_once('/') {
        Some((_, rest)) if !rest.is_empty() => rest.to_string(),
        _ => path.to_string(),
    }
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    let Some(inner) = raw
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    else {
        return raw.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn ensure_safe_path(path: &str) -> Result<(), DiffError> {
    let unsafe_path = path.is_empty()
        || path.starts_with('/')
        || path.starts_with('\\')
        || path
            .split(['/', '\\'])
            .any(|component| component == ".." || component == ".git");
    if unsafe_path {
        return Err(DiffError::UnsafePath(path.to_string()));
    }
    Ok(())
}
