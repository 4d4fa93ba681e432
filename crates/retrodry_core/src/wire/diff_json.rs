//! Diff JSON.
//!
//! ```json
//! {"Key": "Customer|=1", "Version": "v1",
//!  "Customer": [{"Company": "Acme",
//!                "CustomerNote": [{"NoteId": 2, "Note": "edited"}],
//!                "CustomerNote-new": [{"Note": "added"}],
//!                "CustomerNote-deleted": [{"NoteId": 3}]}]}
//! ```
//!
//! Changed rows carry their primary key plus the changed columns. The main
//! row of a single-row persiston carries no primary key.

use super::{as_array, as_object, decode_scalar, encode_scalar, read_header, write_header};
use super::{DELETED_SUFFIX, KEY_MEMBER, NEW_SUFFIX, VERSION_MEMBER};
use crate::diff::{DiffRow, PersistonDiff, TableDiff};
use crate::error::{CoreError, CoreResult};
use crate::schema::{DatonDef, TableDef};
use serde_json::{Map, Value as Json};

/// Encodes a diff as diff JSON. Empty sections are omitted.
pub fn diff_to_json(def: &DatonDef, diff: &PersistonDiff) -> Json {
    let mut object = Map::new();
    write_header(&mut object, &diff.key, &diff.based_on_version);
    write_sections(&mut object, &def.main_table, &diff.main);
    Json::Object(object)
}

fn write_sections(object: &mut Map<String, Json>, table: &TableDef, diff: &TableDiff) {
    if !diff.changed.is_empty() {
        let rows = diff.changed.iter().map(|r| encode_row(table, r)).collect();
        object.insert(table.name.clone(), Json::Array(rows));
    }
    if !diff.new.is_empty() {
        let rows = diff.new.iter().map(|r| encode_row(table, r)).collect();
        object.insert(format!("{}{NEW_SUFFIX}", table.name), Json::Array(rows));
    }
    if !diff.deleted.is_empty() {
        let pk_name = table.primary_key.clone().unwrap_or_default();
        let rows = diff
            .deleted
            .iter()
            .map(|pk| {
                let mut stub = Map::new();
                stub.insert(pk_name.clone(), encode_scalar(pk));
                Json::Object(stub)
            })
            .collect();
        object.insert(format!("{}{DELETED_SUFFIX}", table.name), Json::Array(rows));
    }
}

fn encode_row(table: &TableDef, row: &DiffRow) -> Json {
    let mut object = Map::new();
    if let (Some(pk_name), Some(pk)) = (&table.primary_key, &row.primary_key) {
        object.insert(pk_name.clone(), encode_scalar(pk));
    }
    for col in &table.columns {
        if let Some(value) = row.columns.get(&col.name) {
            object.insert(col.name.clone(), encode_scalar(value));
        }
    }
    for child in &table.children {
        if let Some(child_diff) = row.children.get(&child.name) {
            write_sections(&mut object, child, child_diff);
        }
    }
    Json::Object(object)
}

/// Decodes diff JSON into a [`PersistonDiff`].
///
/// In strict mode unknown members (top-level or inside rows) are rejected;
/// otherwise they are ignored.
pub fn diff_from_json(def: &DatonDef, json: &Json, strict: bool) -> CoreResult<PersistonDiff> {
    let object = as_object(json, "diff")?;
    let (key, based_on_version) = read_header(def, object)?;
    if !key.is_persiston() {
        return Err(CoreError::invalid_wire(format!("{key} is not a persiston key")));
    }
    let table = &def.main_table;
    if strict {
        let allowed = |k: &str| {
            k == KEY_MEMBER || k == VERSION_MEMBER || section_of(table, k).is_some()
        };
        if let Some(unknown) = object.keys().find(|k| !allowed(k)) {
            return Err(CoreError::UnexpectedKey {
                key: unknown.clone(),
            });
        }
    }
    let mut main = read_sections(object, table, strict)?;
    strip_key_column(table, &mut main);
    Ok(PersistonDiff {
        key,
        based_on_version,
        main,
    })
}

/// Parses diff JSON text.
pub fn diff_from_str(def: &DatonDef, text: &str, strict: bool) -> CoreResult<PersistonDiff> {
    let json: Json = serde_json::from_str(text)?;
    diff_from_json(def, &json, strict)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Changed,
    New,
    Deleted,
}

fn section_of(table: &TableDef, member: &str) -> Option<Section> {
    let rest = member.strip_prefix(table.name.as_str())?;
    match rest {
        "" => Some(Section::Changed),
        NEW_SUFFIX => Some(Section::New),
        DELETED_SUFFIX => Some(Section::Deleted),
        _ => None,
    }
}

fn read_sections(object: &Map<String, Json>, table: &TableDef, strict: bool) -> CoreResult<TableDiff> {
    let mut diff = TableDiff::default();
    for (member, items) in object {
        let Some(section) = section_of(table, member) else {
            continue;
        };
        for item in as_array(items, member)? {
            match section {
                Section::Changed => diff.changed.push(decode_row(table, item, strict)?),
                Section::New => diff.new.push(decode_row(table, item, strict)?),
                Section::Deleted => {
                    let row = decode_row(table, item, strict)?;
                    let pk = row.primary_key.ok_or_else(|| {
                        CoreError::invalid_wire(format!("{member} entry has no primary key"))
                    })?;
                    diff.deleted.push(pk);
                }
            }
        }
    }
    Ok(diff)
}

fn decode_row(table: &TableDef, json: &Json, strict: bool) -> CoreResult<DiffRow> {
    let object = as_object(json, &table.name)?;
    let mut row = DiffRow::default();
    for (member, value) in object {
        if let Some(col) = table.column_def(member) {
            let decoded = decode_scalar(value, col)?;
            if table.primary_key.as_deref() == Some(member.as_str()) && !decoded.is_null() {
                row.primary_key = Some(decoded.clone());
            }
            row.columns.insert(member.clone(), decoded);
        } else if table.children.iter().any(|c| section_of(c, member).is_some()) {
            // Child sections are read below.
        } else if strict {
            return Err(CoreError::UnexpectedKey {
                key: member.clone(),
            });
        }
    }
    for child in &table.children {
        let child_diff = read_sections(object, child, strict)?;
        if !child_diff.is_empty() {
            row.children.insert(child.name.clone(), child_diff);
        }
    }
    Ok(row)
}

/// The primary key of a changed row addresses it; it is not a change.
fn strip_key_column(table: &TableDef, diff: &mut TableDiff) {
    for row in &mut diff.changed {
        if let Some(pk) = &table.primary_key {
            if row.primary_key.is_some() {
                row.columns.remove(pk);
            }
        }
        for child in &table.children {
            if let Some(child_diff) = row.children.get_mut(&child.name) {
                strip_key_column(child, child_diff);
            }
        }
    }
    for row in &mut diff.new {
        for child in &table.children {
            if let Some(child_diff) = row.children.get_mut(&child.name) {
                strip_key_column(child, child_diff);
            }
        }
    }
}
