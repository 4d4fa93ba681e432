//! Verbose (named) daton JSON.

use super::{as_array, as_object, decode_scalar, encode_scalar, missing_value, read_header, write_header};
use super::{KEY_MEMBER, VERSION_MEMBER};
use crate::daton::{Daton, Row};
use crate::error::{CoreError, CoreResult};
use crate::schema::{DatonDef, TableDef};
use serde_json::{Map, Value as Json};

/// Encodes a daton as verbose JSON.
///
/// The main table is an object for a single-row persiston and an array
/// otherwise. Child tables are arrays nested in their parent row.
pub fn to_verbose(def: &DatonDef, daton: &Daton) -> Json {
    let mut object = Map::new();
    write_header(&mut object, &daton.key, &daton.version);
    let table = &def.main_table;
    if def.is_single_row() {
        if let Some(row) = daton.main_row() {
            object.insert(table.name.clone(), encode_row(table, row));
        }
    } else {
        let rows = daton.rows.iter().map(|r| encode_row(table, r)).collect();
        object.insert(table.name.clone(), Json::Array(rows));
    }
    Json::Object(object)
}

pub(crate) fn encode_row(table: &TableDef, row: &Row) -> Json {
    let mut object = Map::new();
    for col in &table.columns {
        object.insert(col.name.clone(), encode_scalar(row.value(&col.name)));
    }
    for child in &table.children {
        let rows = row
            .child_rows(&child.name)
            .iter()
            .map(|r| encode_row(child, r))
            .collect();
        object.insert(child.name.clone(), Json::Array(rows));
    }
    Json::Object(object)
}

/// Decodes verbose JSON into a daton.
///
/// Missing columns become null (nullable) or the type default. In strict
/// mode unknown top-level members are rejected.
pub fn from_verbose(def: &DatonDef, json: &Json, strict: bool) -> CoreResult<Daton> {
    let object = as_object(json, "daton")?;
    let (key, version) = read_header(def, object)?;
    let table = &def.main_table;
    if strict {
        if let Some(unknown) = object
            .keys()
            .find(|k| *k != KEY_MEMBER && *k != VERSION_MEMBER && **k != table.name)
        {
            return Err(CoreError::UnexpectedKey {
                key: unknown.clone(),
            });
        }
    }
    let rows = match object.get(&table.name) {
        None | Some(Json::Null) => Vec::new(),
        Some(Json::Array(items)) => items
            .iter()
            .map(|item| decode_row(table, item))
            .collect::<CoreResult<_>>()?,
        Some(single @ Json::Object(_)) => vec![decode_row(table, single)?],
        Some(_) => {
            return Err(CoreError::invalid_wire(format!(
                "{} must be an object or array",
                table.name
            )))
        }
    };
    let daton = Daton { key, version, rows };
    daton.check_shape(def)?;
    Ok(daton)
}

pub(crate) fn decode_row(table: &TableDef, json: &Json) -> CoreResult<Row> {
    let object = as_object(json, &table.name)?;
    let mut row = Row::new();
    for col in &table.columns {
        let value = match object.get(&col.name) {
            Some(v) => decode_scalar(v, col)?,
            None => missing_value(col),
        };
        row.cells.insert(col.name.clone(), value);
    }
    for child in &table.children {
        let rows = match object.get(&child.name) {
            None | Some(Json::Null) => Vec::new(),
            Some(items) => as_array(items, &child.name)?
                .iter()
                .map(|item| decode_row(child, item))
                .collect::<CoreResult<_>>()?,
        };
        row.children.insert(child.name.clone(), rows);
    }
    Ok(row)
}
