//! Dictionary command implementation.

use super::{CliError, OutputFormat};
use retrodry_core::{DataDictionary, DatonDef, DatonKind, TableDef};
use serde::Serialize;

/// Summary of one daton type.
#[derive(Debug, Serialize)]
pub struct DatonSummary {
    /// Daton type name.
    pub name: String,
    /// `persiston`, `whole-table` or `viewon`.
    pub kind: &'static str,
    /// Main table, then child tables depth-first.
    pub tables: Vec<TableSummary>,
    /// Viewon criteria columns.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<String>,
    /// Viewon rows per page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
}

/// Summary of one table.
#[derive(Debug, Serialize)]
pub struct TableSummary {
    /// Table name.
    pub name: String,
    /// Nesting depth; 0 for the main table.
    pub depth: usize,
    /// Primary key column.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    /// Columns as `name: type`, with `?` marking nullable ones.
    pub columns: Vec<String>,
}

impl DatonSummary {
    fn of(def: &DatonDef) -> Self {
        let kind = match def.kind {
            DatonKind::SingleRowPersiston => "persiston",
            DatonKind::WholeTablePersiston => "whole-table",
            DatonKind::Viewon => "viewon",
        };
        let mut tables = Vec::new();
        collect_tables(&def.main_table, 0, &mut tables);
        Self {
            name: def.name.clone(),
            kind,
            tables,
            criteria: def
                .criteria
                .iter()
                .flat_map(|c| c.columns.iter().map(|col| col.name.clone()))
                .collect(),
            page_size: def.page_size,
        }
    }
}

fn collect_tables(table: &TableDef, depth: usize, out: &mut Vec<TableSummary>) {
    out.push(TableSummary {
        name: table.name.clone(),
        depth,
        primary_key: table.primary_key.clone(),
        columns: table
            .columns
            .iter()
            .map(|c| {
                let nullable = if c.nullable { "?" } else { "" };
                format!("{}: {}{nullable}", c.name, c.wire_type.wire_name())
            })
            .collect(),
    });
    for child in &table.children {
        collect_tables(child, depth + 1, out);
    }
}

/// Runs the dictionary command.
pub fn run(dictionary: &DataDictionary, format: OutputFormat) -> Result<String, CliError> {
    let summaries: Vec<DatonSummary> = dictionary.iter().map(|def| DatonSummary::of(def.as_ref())).collect();
    Ok(match format {
        OutputFormat::Json => serde_json::to_string_pretty(&summaries)?,
        OutputFormat::Text => render_text(&summaries),
    })
}

fn render_text(summaries: &[DatonSummary]) -> String {
    let mut lines = Vec::new();
    for daton in summaries {
        lines.push(format!("{} ({})", daton.name, daton.kind));
        if !daton.criteria.is_empty() {
            lines.push(format!("  criteria: {}", daton.criteria.join(", ")));
        }
        if let Some(size) = daton.page_size {
            lines.push(format!("  page size: {size}"));
        }
        for table in &daton.tables {
            let indent = "  ".repeat(table.depth + 1);
            let key = table
                .primary_key
                .as_deref()
                .map(|pk| format!(" [key {pk}]"))
                .unwrap_or_default();
            lines.push(format!("{indent}{}{key}", table.name));
            for col in &table.columns {
                lines.push(format!("{indent}  {col}"));
            }
        }
    }
    lines.join("\n")
}
