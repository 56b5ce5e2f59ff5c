//! Proposal loading with JSON Schema validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;

use crate::core::types::ChangeProposal;

pub const PROPOSAL_SCHEMA: &str =
    include_str!("../../../schemas/change_proposal/v1.schema.json");

/// Read, validate and deserialize a proposal file.
pub fn load_proposal(path: &Path) -> Result<ChangeProposal> {
    let raw = fs::read_to_string(path).with_context(|| format!("read proposal {}", path.display()))?;
    parse_proposal(&raw).with_context(|| format!("load proposal {}", path.display()))
}

pub fn parse_proposal(raw: &str) -> Result<ChangeProposal> {
    let instance: Value = serde_json::from_str(raw).context("parse proposal json")?;
    let schema: Value = serde_json::from_str(PROPOSAL_SCHEMA).context("parse proposal schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile proposal schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("proposal schema validation failed:\n- {}", messages.join("\n- "));
    }
    serde_json::from_value(instance).context("deserialize proposal")
}
