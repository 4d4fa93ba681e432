//! Runtime daton values: generic rows driven by the schema.

use crate::error::{CoreError, CoreResult};
use crate::key::DatonKey;
use crate::schema::{DatonDef, TableDef};
use crate::value::Value;
use std::collections::BTreeMap;

/// One row: scalar cells by column name plus child row lists by table name.
///
/// Equality treats a missing child list and an empty one as the same.
#[derive(Debug, Clone, Default)]
pub struct Row {
    /// Scalar values by column name.
    pub cells: BTreeMap<String, Value>,
    /// Child rows by child table name.
    pub children: BTreeMap<String, Vec<Row>>,
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        let non_empty = |row: &Row| {
            row.children
                .iter()
                .filter(|(_, rows)| !rows.is_empty())
                .map(|(name, rows)| (name.clone(), rows.clone()))
                .collect::<BTreeMap<_, _>>()
        };
        self.cells == other.cells && non_empty(self) == non_empty(other)
    }
}

impl Eq for Row {}

impl Row {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style cell setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    /// Builder-style child row appender.
    pub fn with_child(mut self, table: impl Into<String>, row: Row) -> Self {
        self.children.entry(table.into()).or_default().push(row);
        self
    }

    /// Returns a cell value.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.cells.get(column)
    }

    /// Returns a cell value, treating a missing cell as null.
    pub fn value(&self, column: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.cells.get(column).unwrap_or(&NULL)
    }

    /// Sets a cell value.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.cells.insert(column.into(), value.into());
    }

    /// Child rows of a table (empty if none).
    pub fn child_rows(&self, table: &str) -> &[Row] {
        self.children.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Mutable child rows of a table, created on demand.
    pub fn child_rows_mut(&mut self, table: &str) -> &mut Vec<Row> {
        self.children.entry(table.to_string()).or_default()
    }

    /// Deep copy restricted to the columns and child tables of `table`.
    ///
    /// Columns declared by the table but missing from the row are left out;
    /// child lists are always present for declared child tables.
    pub fn clone_for(&self, table: &TableDef) -> Row {
        let cells = table
            .columns
            .iter()
            .filter_map(|col| self.cells.get(&col.name).map(|v| (col.name.clone(), v.clone())))
            .collect();
        let children = table
            .children
            .iter()
            .map(|child| {
                let rows = self
                    .child_rows(&child.name)
                    .iter()
                    .map(|r| r.clone_for(child))
                    .collect();
                (child.name.clone(), rows)
            })
            .collect();
        Row { cells, children }
    }
}

/// A daton instance: key, version token and main-table rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Daton {
    /// Identity.
    pub key: DatonKey,
    /// Opaque version token from the server; `None` for unsaved datons.
    pub version: Option<String>,
    /// Main table rows (exactly one for a single-row persiston).
    pub rows: Vec<Row>,
}

impl Daton {
    /// Creates a daton with no version.
    pub fn new(key: DatonKey, rows: Vec<Row>) -> Self {
        Self {
            key,
            version: None,
            rows,
        }
    }

    /// Builder-style version setter.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// The main row of a single-row persiston.
    pub fn main_row(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Mutable main row of a single-row persiston.
    pub fn main_row_mut(&mut self) -> Option<&mut Row> {
        self.rows.first_mut()
    }

    /// Structurally independent copy containing only schema-declared fields.
    pub fn clone_for(&self, def: &DatonDef) -> Daton {
        Daton {
            key: self.key.clone(),
            version: self.version.clone(),
            rows: self.rows.iter().map(|r| r.clone_for(&def.main_table)).collect(),
        }
    }

    /// Checks that the daton shape matches its definition.
    pub fn check_shape(&self, def: &DatonDef) -> CoreResult<()> {
        if self.key.type_name() != def.name {
            return Err(CoreError::invalid_wire(format!(
                "daton {} does not belong to {}",
                self.key, def.name
            )));
        }
        if def.is_single_row() && self.rows.len() > 1 {
            return Err(CoreError::invalid_wire(format!(
                "single-row daton {} has {} rows",
                self.key,
                self.rows.len()
            )));
        }
        Ok(())
    }
}

/// Schema-restricted deep copy of a daton.
pub fn clone_daton(def: &DatonDef, daton: &Daton) -> Daton {
    daton.clone_for(def)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColDef;
    use crate::value::WireType;

    fn note_def() -> DatonDef {
        DatonDef::persiston(
            "Customer",
            TableDef::new("Customer")
                .primary_key("CustomerId")
                .column(ColDef::new("CustomerId", WireType::Int32))
                .column(ColDef::new("Company", WireType::Text))
                .child(
                    TableDef::new("CustomerNote")
                        .primary_key("NoteId")
                        .parent_key("CustomerId")
                        .column(ColDef::new("NoteId", WireType::Int32))
                        .column(ColDef::new("CustomerId", WireType::Int32))
                        .column(ColDef::new("Note", WireType::Text)),
                ),
        )
        .build()
        .unwrap()
    }

    #[test]
    fn clone_drops_extraneous_fields_and_is_idempotent() {
        let def = note_def();
        let daton = Daton::new(
            DatonKey::row("Customer", 1),
            vec![Row::new()
                .with("CustomerId", 1)
                .with("Company", "Acme")
                .with("Scratch", "ui state")
                .with_child(
                    "CustomerNote",
                    Row::new().with("NoteId", 5).with("Note", "hi").with("Tmp", true),
                )
                .with_child("Unknown", Row::new())],
        )
        .with_version("v1");

        let once = clone_daton(&def, &daton);
        let row = once.main_row().unwrap();
        assert!(row.get("Scratch").is_none());
        assert!(!row.children.contains_key("Unknown"));
        assert!(row.child_rows("CustomerNote")[0].get("Tmp").is_none());
        assert_eq!(clone_daton(&def, &once), once);
        assert_eq!(once.version.as_deref(), Some("v1"));
    }

    #[test]
    fn shape_check() {
        let def = note_def();
        let two_rows = Daton::new(DatonKey::row("Customer", 1), vec![Row::new(), Row::new()]);
        assert!(two_rows.check_shape(&def).is_err());
        let wrong_type = Daton::new(DatonKey::row("Widget", 1), vec![]);
        assert!(wrong_type.check_shape(&def).is_err());
    }
}
