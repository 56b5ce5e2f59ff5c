//! Parse checks for source files, chosen by extension.

use std::path::Path;

use thiserror::Error;

/// Source languages with a registered parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Python,
    Rust,
    Json,
    Toml,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "py" | "pyi" => Some(Self::Python),
            "rs" => Some(Self::Rust),
            "json" => Some(Self::Json),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

/// First parse error in a file. `line` and `column` are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{line}:{column}: {message}")]
pub struct SourceError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Parse `source` as `kind`.
pub fn check_source(kind: SourceKind, source: &str) -> Result<(), SourceError> {
    match kind {
        SourceKind::Python => check_tree_sitter(tree_sitter_python::LANGUAGE.into(), source),
        SourceKind::Rust => check_tree_sitter(tree_sitter_rust::LANGUAGE.into(), source),
        SourceKind::Json => serde_json::from_str::<serde_json::Value>(source)
            .map(|_| ())
            .map_err(|err| SourceError {
                line: err.line(),
                column: err.column(),
                message: err.to_string(),
            }),
        SourceKind::Toml => toml::from_str::<toml::Table>(source)
            .map(|_| ())
            .map_err(|err| toml_error(source, &err)),
    }
}

fn check_tree_sitter(language: tree_sitter::Language, source: &str) -> Result<(), SourceError> {
    let mut parser = tree_sitter::Parser::new();
    parser.set_language(&language).map_err(|err| SourceError {
        line: 1,
        column: 1,
        message: format!("parser unavailable: {err}"),
    })?;
    let tree = parser.parse(source, None).ok_or_else(|| SourceError {
        line: 1,
        column: 1,
        message: "parser gave up".to_string(),
    })?;
    let root = tree.root_node();
    if !root.has_error() {
        return Ok(());
    }
    let node = first_error(root).unwrap_or(root);
    let position = node.start_position();
    let message = if node.is_missing() {
        format!("missing {}", node.kind())
    } else {
        let text = node
            .utf8_text(source.as_bytes())
            .unwrap_or_default()
            .lines()
            .next()
            .unwrap_or_default()
            .trim();
        if text.is_empty() {
            "invalid syntax".to_string()
        } else {
            format!("invalid syntax near `{}`", truncate(text, 40))
        }
    };
    Err(SourceError {
        line: position.row + 1,
        column: position.column + 1,
        message,
    })
}

/// Depth-first search for the first ERROR or MISSING node.
fn first_error(node: tree_sitter::Node) -> Option<tree_sitter::Node> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i)
            && let Some(found) = first_error(child)
        {
            return Some(found);
        }
    }
    None
}

fn toml_error(source: &str, err: &toml::de::Error) -> SourceError {
    let (line, column) = match err.span() {
        Some(span) => line_col(source, span.start),
        None => (1, 1),
    };
    SourceError {
        line,
        column,
        message: err.message().to_string(),
    }
}

fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let before = source.get(..offset).unwrap_or(source);
    let line = before.matches('\n').count() + 1;
    let column = before
        .rsplit('\n')
        .next()
        .map(|tail| tail.chars().count())
        .unwrap_or(0)
        + 1;
    (line, column)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
