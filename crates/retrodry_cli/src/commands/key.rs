//! Key command implementation.

use super::{CliError, OutputFormat};
use retrodry_core::DatonKey;
use serde::Serialize;

/// Parts of a parsed key.
#[derive(Debug, Serialize)]
pub struct KeyInfo {
    /// Canonical text form.
    pub canonical: String,
    /// Daton type name.
    pub type_name: String,
    /// `row`, `whole-table` or `viewon`.
    pub kind: &'static str,
    /// Primary key text of a single-row persiston.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    /// True for client-assigned keys not yet saved.
    pub is_new: bool,
    /// Viewon criteria as name/value pairs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<(String, String)>,
    /// Viewon sort column.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    /// Viewon page, zero-based.
    pub page: usize,
}

impl KeyInfo {
    /// Describes a key.
    pub fn of(key: &DatonKey) -> Self {
        let kind = if key.is_whole_table() {
            "whole-table"
        } else if key.is_persiston() {
            "row"
        } else {
            "viewon"
        };
        Self {
            canonical: key.to_string(),
            type_name: key.type_name().to_string(),
            kind,
            primary_key: key.persiston_key_str().map(str::to_string),
            is_new: key.is_new(),
            criteria: key.criteria().map(|c| (c.name.clone(), c.value.clone())).collect(),
            sort: key.sort_column().map(str::to_string),
            page: key.page(),
        }
    }
}

/// Runs the key command.
pub fn run(text: &str, format: OutputFormat) -> Result<String, CliError> {
    let key = DatonKey::parse(text)?;
    let info = KeyInfo::of(&key);
    Ok(match format {
        OutputFormat::Json => serde_json::to_string_pretty(&info)?,
        OutputFormat::Text => render_text(&info),
    })
}

fn render_text(info: &KeyInfo) -> String {
    let mut lines = vec![
        format!("Key:        {}", info.canonical),
        format!("Type:       {}", info.type_name),
        format!("Kind:       {}", info.kind),
    ];
    if let Some(pk) = &info.primary_key {
        let marker = if info.is_new { " (new)" } else { "" };
        lines.push(format!("Row key:    {pk}{marker}"));
    }
    for (name, value) in &info.criteria {
        lines.push(format!("Criterion:  {name} = {value:?}"));
    }
    if let Some(sort) = &info.sort {
        lines.push(format!("Sort:       {sort}"));
    }
    if info.kind == "viewon" {
        lines.push(format!("Page:       {}", info.page));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_viewon_keys() {
        let out = run(r"CustomerList|_page=2|_sort=Company|Company=a\|b", OutputFormat::Text).unwrap();
        assert!(out.contains("Kind:       viewon"));
        assert!(out.contains(r#"Criterion:  Company = "a|b""#));
        assert!(out.contains("Sort:       Company"));
        assert!(out.contains("Page:       2"));
    }

    #[test]
    fn json_output_for_new_rows() {
        let out = run("Customer|=-1", OutputFormat::Json).unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(json["kind"], "row");
        assert_eq!(json["primary_key"], "-1");
        assert_eq!(json["is_new"], true);
    }

    #[test]
    fn malformed_keys_fail() {
        assert!(matches!(run("Customer|nonsense", OutputFormat::Text), Err(CliError::Core(_))));
    }
}
