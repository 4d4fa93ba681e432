//! Convert command implementation.

use super::{read_json, CliError};
use retrodry_core::wire::{decode_daton, encode_daton, peek_key};
use retrodry_core::{DataDictionary, Encoding};
use std::path::Path;
use tracing::debug;

/// Runs the convert command: decodes daton JSON in either encoding and
/// writes it back in the requested one.
pub fn run(dictionary: &DataDictionary, input: &Path, dense: bool) -> Result<String, CliError> {
    let json = read_json(input)?;
    let key = peek_key(&json)?;
    let def = dictionary.def_for(&key)?;
    let daton = decode_daton(def, &json, true)?;
    debug!(key = %key, rows = daton.rows.len(), "decoded daton");
    let encoding = if dense { Encoding::Dense } else { Encoding::Verbose };
    Ok(serde_json::to_string_pretty(&encode_daton(def, &daton, encoding))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrodry_testkit::sample_dictionary;
    use serde_json::json;

    #[test]
    fn verbose_to_dense_and_back() {
        let dictionary = sample_dictionary();
        let dir = tempfile::tempdir().unwrap();
        let verbose = dir.path().join("widget.json");
        let original = json!({
            "Key": "Widget|=1",
            "Version": "v7",
            "Widget": {"WidgetId": 1, "ItemCode": "HEXNUT", "Notes": null}
        });
        std::fs::write(&verbose, original.to_string()).unwrap();

        let dense_text = run(&dictionary, &verbose, true).unwrap();
        let dense: serde_json::Value = serde_json::from_str(&dense_text).unwrap();
        assert!(dense.get("Content").is_some());

        let dense_path = dir.path().join("widget-dense.json");
        std::fs::write(&dense_path, dense_text).unwrap();
        let back: serde_json::Value = serde_json::from_str(&run(&dictionary, &dense_path, false).unwrap()).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn unknown_daton_types_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gadget.json");
        std::fs::write(&path, r#"{"Key": "Gadget|=1"}"#).unwrap();
        assert!(matches!(run(&sample_dictionary(), &path, true), Err(CliError::Core(_))));
    }
}
