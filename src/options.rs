//! Parsing of caller-supplied form values: patch options and explicit
//! patch selection.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::PatchError;

/// Option values keyed by patch name, then by option key.
pub type PatchOptions = BTreeMap<String, BTreeMap<String, Value>>;

/// Parse the `options` JSON object. Blank input means no options.
pub fn parse_options(input: Option<&str>) -> Result<PatchOptions, PatchError> {
    let Some(input) = input.filter(|s| !s.trim().is_empty()) else {
        return Ok(PatchOptions::new());
    };
    serde_json::from_str(input)
        .map_err(|e| PatchError::invalid(format!("Unable to parse options JSON: {e}")))
}

/// Parse the `selectedPatches` JSON array. Blank input means no explicit selection.
pub fn parse_selected_patches(input: Option<&str>) -> Result<BTreeSet<String>, PatchError> {
    let Some(input) = input.filter(|s| !s.trim().is_empty()) else {
        return Ok(BTreeSet::new());
    };
    serde_json::from_str(input)
        .map_err(|e| PatchError::invalid(format!("Unable to parse selected patches JSON: {e}")))
}
