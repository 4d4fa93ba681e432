//! Structural diff and patch of datons.
//!
//! Rows are matched by primary key. A row without a primary key, or whose key
//! is absent from the pristine rows, is new. The main row of a single-row
//! persiston is identified by the daton key and carries no primary key.

use crate::daton::{Daton, Row};
use crate::error::{CoreError, CoreResult};
use crate::key::DatonKey;
use crate::schema::{DatonDef, PermissionLevel, TableDef};
use crate::value::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Changes to one table's rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDiff {
    /// Existing rows: primary key plus changed columns and child diffs.
    pub changed: Vec<DiffRow>,
    /// Rows to add, complete with their child rows.
    pub new: Vec<DiffRow>,
    /// Primary keys of rows to remove.
    pub deleted: Vec<Value>,
}

impl TableDiff {
    /// Returns true if nothing changed in this table.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.new.is_empty() && self.deleted.is_empty()
    }
}

/// One changed or new row in a diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffRow {
    /// Primary key; `None` for the main row of a single-row persiston and for
    /// new rows that have no key yet.
    pub primary_key: Option<Value>,
    /// Changed (or, for new rows, all) column values in declaration order.
    pub columns: BTreeMap<String, Value>,
    /// Child table diffs by table name.
    pub children: BTreeMap<String, TableDiff>,
}

impl DiffRow {
    /// Returns true if the row carries no column or child changes.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.children.values().all(TableDiff::is_empty)
    }

    /// Converts a new-row entry into a full row.
    pub fn to_row(&self) -> Row {
        Row {
            cells: self.columns.clone(),
            children: self
                .children
                .iter()
                .map(|(name, diff)| (name.clone(), diff.new.iter().map(DiffRow::to_row).collect()))
                .collect(),
        }
    }

    fn from_new_row(table: &TableDef, row: &Row) -> DiffRow {
        let columns = table
            .columns
            .iter()
            .filter_map(|c| row.get(&c.name).map(|v| (c.name.clone(), v.clone())))
            .collect();
        let children = table
            .children
            .iter()
            .filter_map(|child| {
                let rows = row.child_rows(&child.name);
                (!rows.is_empty()).then(|| {
                    let diff = TableDiff {
                        new: rows.iter().map(|r| DiffRow::from_new_row(child, r)).collect(),
                        ..TableDiff::default()
                    };
                    (child.name.clone(), diff)
                })
            })
            .collect();
        DiffRow {
            primary_key: table.primary_key_of(row).cloned(),
            columns,
            children,
        }
    }
}

/// The delta that turns a pristine persiston into a modified one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistonDiff {
    /// Key of the daton being changed.
    pub key: DatonKey,
    /// Version of the pristine daton the diff was computed against.
    pub based_on_version: Option<String>,
    /// Changes to the main table.
    pub main: TableDiff,
}

impl PersistonDiff {
    /// Returns true if the diff carries no changes.
    pub fn is_empty(&self) -> bool {
        self.main.is_empty()
    }

    /// Removes changes the restricted definition does not allow.
    ///
    /// `def` must come from [`DatonDef::restricted_for`]. Columns below
    /// [`PermissionLevel::Modify`] are dropped from changed and new rows;
    /// changes to tables below that level are dropped entirely. Returns the
    /// dotted `Table.Column` (or `Table`) names that were removed.
    pub fn strip_unmodifiable(&mut self, def: &DatonDef) -> Vec<String> {
        let mut denied = Vec::new();
        strip_table(&def.main_table, &mut self.main, &mut denied);
        denied.sort();
        denied.dedup();
        denied
    }
}

fn strip_table(table: &TableDef, diff: &mut TableDiff, denied: &mut Vec<String>) {
    if diff.is_empty() {
        return;
    }
    if table.level() < PermissionLevel::Modify {
        denied.push(table.name.clone());
        *diff = TableDiff::default();
        return;
    }
    for row in diff.changed.iter_mut().chain(diff.new.iter_mut()) {
        row.columns.retain(|name, _| {
            let keep = table
                .column_def(name)
                .is_some_and(|c| c.level() == PermissionLevel::Modify || is_key_column(table, name));
            if !keep {
                denied.push(format!("{}.{}", table.name, name));
            }
            keep
        });
        row.children.retain(|name, child_diff| match table.child_def(name) {
            Some(child) => {
                strip_table(child, child_diff, denied);
                !child_diff.is_empty()
            }
            None => {
                denied.push(name.clone());
                false
            }
        });
    }
    diff.changed.retain(|row| !row.is_empty());
}

fn is_key_column(table: &TableDef, name: &str) -> bool {
    table.primary_key.as_deref() == Some(name) || table.parent_key.as_deref() == Some(name)
}

/// Computes the diff between a pristine and a modified daton.
pub fn diff(def: &DatonDef, pristine: &Daton, modified: &Daton) -> CoreResult<PersistonDiff> {
    if !def.kind.is_persiston() {
        return Err(CoreError::diff_mismatch(format!("{} is not a persiston", def.name)));
    }
    modified.check_shape(def)?;
    let main = if def.is_single_row() {
        diff_single_row(&def.main_table, pristine.main_row(), modified.main_row())
    } else {
        diff_rows(&def.main_table, &pristine.rows, &modified.rows)
    };
    Ok(PersistonDiff {
        key: modified.key.clone(),
        based_on_version: pristine.version.clone(),
        main,
    })
}

fn diff_single_row(table: &TableDef, pristine: Option<&Row>, modified: Option<&Row>) -> TableDiff {
    let mut diff = TableDiff::default();
    match (pristine, modified) {
        (Some(p), Some(m)) => {
            let row = diff_row(table, p, m, None);
            if !row.is_empty() {
                diff.changed.push(row);
            }
        }
        (None, Some(m)) => diff.new.push(DiffRow::from_new_row(table, m)),
        (Some(p), None) => {
            if let Some(pk) = table.primary_key_of(p) {
                diff.deleted.push(pk.clone());
            }
        }
        (None, None) => {}
    }
    diff
}

fn diff_rows(table: &TableDef, pristine: &[Row], modified: &[Row]) -> TableDiff {
    let mut diff = TableDiff::default();
    let by_key: HashMap<&Value, &Row> = pristine
        .iter()
        .filter_map(|r| table.primary_key_of(r).map(|pk| (pk, r)))
        .collect();
    let mut seen: HashSet<&Value> = HashSet::new();

    for row in modified {
        let matched = table
            .primary_key_of(row)
            .and_then(|pk| by_key.get(pk).map(|p| (pk, *p)));
        match matched {
            Some((pk, before)) => {
                seen.insert(pk);
                let row_diff = diff_row(table, before, row, Some(pk.clone()));
                if !row_diff.is_empty() {
                    diff.changed.push(row_diff);
                }
            }
            None => diff.new.push(DiffRow::from_new_row(table, row)),
        }
    }
    diff.deleted = pristine
        .iter()
        .filter_map(|r| table.primary_key_of(r))
        .filter(|pk| !seen.contains(pk))
        .cloned()
        .collect();
    diff
}

fn diff_row(table: &TableDef, pristine: &Row, modified: &Row, primary_key: Option<Value>) -> DiffRow {
    let columns = table
        .columns
        .iter()
        .filter(|c| pristine.value(&c.name) != modified.value(&c.name))
        .map(|c| (c.name.clone(), modified.value(&c.name).clone()))
        .collect();
    let children = table
        .children
        .iter()
        .filter_map(|child| {
            let child_diff = diff_rows(
                child,
                pristine.child_rows(&child.name),
                modified.child_rows(&child.name),
            );
            (!child_diff.is_empty()).then(|| (child.name.clone(), child_diff))
        })
        .collect();
    DiffRow {
        primary_key,
        columns,
        children,
    }
}

/// Applies a diff to `target` in place. Applying the same diff twice is not supported.
pub fn apply(def: &DatonDef, delta: &PersistonDiff, target: &mut Daton) -> CoreResult<()> {
    if delta.key.type_name() != def.name {
        return Err(CoreError::diff_mismatch(format!(
            "diff for {} applied to {}",
            delta.key, def.name
        )));
    }
    if def.is_single_row() {
        for change in &delta.main.changed {
            let row = match &change.primary_key {
                None => target.rows.first_mut(),
                Some(pk) => find_row_mut(&def.main_table, &mut target.rows, pk),
            }
            .ok_or_else(|| CoreError::diff_mismatch("main row missing"))?;
            apply_row(&def.main_table, change, row)?;
        }
        apply_new_and_deleted(&def.main_table, &delta.main, &mut target.rows)
    } else {
        apply_table(&def.main_table, &delta.main, &mut target.rows)
    }
}

fn apply_table(table: &TableDef, delta: &TableDiff, rows: &mut Vec<Row>) -> CoreResult<()> {
    for change in &delta.changed {
        let pk = change.primary_key.as_ref().ok_or_else(|| {
            CoreError::diff_mismatch(format!("changed row of {} has no primary key", table.name))
        })?;
        let row = find_row_mut(table, rows, pk).ok_or_else(|| {
            CoreError::diff_mismatch(format!("{} row {} not found", table.name, pk.to_key_text()))
        })?;
        apply_row(table, change, row)?;
    }
    apply_new_and_deleted(table, delta, rows)
}

fn apply_new_and_deleted(table: &TableDef, delta: &TableDiff, rows: &mut Vec<Row>) -> CoreResult<()> {
    for pk in &delta.deleted {
        let before = rows.len();
        rows.retain(|r| table.primary_key_of(r) != Some(pk));
        if rows.len() == before {
            return Err(CoreError::diff_mismatch(format!(
                "{} row {} not found for delete",
                table.name,
                pk.to_key_text()
            )));
        }
    }
    rows.extend(delta.new.iter().map(DiffRow::to_row));
    Ok(())
}

fn apply_row(table: &TableDef, change: &DiffRow, row: &mut Row) -> CoreResult<()> {
    for (name, value) in &change.columns {
        row.set(name.clone(), value.clone());
    }
    for (name, child_diff) in &change.children {
        let child = table
            .child_def(name)
            .ok_or_else(|| CoreError::diff_mismatch(format!("unknown child table {name}")))?;
        apply_table(child, child_diff, row.child_rows_mut(name))?;
    }
    Ok(())
}

fn find_row_mut<'a>(table: &TableDef, rows: &'a mut [Row], pk: &Value) -> Option<&'a mut Row> {
    rows.iter_mut().find(|r| table.primary_key_of(r) == Some(pk))
}
