//! Diff command implementation.

use super::{read_json, CliError};
use retrodry_core::wire::diff_json::diff_to_json;
use retrodry_core::wire::{decode_daton, peek_key};
use retrodry_core::{diff, CoreError, DataDictionary};
use std::path::Path;
use tracing::debug;

/// Runs the diff command: prints the diff JSON a client would send to save
/// `modified`, given it loaded `pristine`.
pub fn run(dictionary: &DataDictionary, pristine: &Path, modified: &Path) -> Result<String, CliError> {
    let pristine = read_json(pristine)?;
    let modified = read_json(modified)?;
    let key = peek_key(&modified)?;
    let pristine_key = peek_key(&pristine)?;
    if pristine_key != key && !key.is_new() {
        return Err(CoreError::diff_mismatch(format!("comparing {pristine_key} with {key}")).into());
    }
    let def = dictionary.def_for(&key)?;
    let before = decode_daton(def, &pristine, true)?;
    let after = decode_daton(def, &modified, true)?;
    let delta = diff::diff(def, &before, &after)?;
    debug!(key = %key, empty = delta.is_empty(), "diff computed");
    Ok(serde_json::to_string_pretty(&diff_to_json(def, &delta))?)
}
