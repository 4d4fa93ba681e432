//! Dense (positional) daton JSON.
//!
//! Each row is an array of its column values in declaration order followed
//! by one nested array of rows per child table, also in declaration order.

use super::{as_array, as_object, decode_scalar, encode_scalar, missing_value, read_header, write_header};
use super::{CONTENT_MEMBER, KEY_MEMBER, VERSION_MEMBER};
use crate::daton::{Daton, Row};
use crate::error::{CoreError, CoreResult};
use crate::schema::{DatonDef, TableDef};
use serde_json::{Map, Value as Json};

/// Encodes a daton as dense JSON.
pub fn to_dense(def: &DatonDef, daton: &Daton) -> Json {
    let mut object = Map::new();
    write_header(&mut object, &daton.key, &daton.version);
    let rows = daton
        .rows
        .iter()
        .map(|r| encode_row(&def.main_table, r))
        .collect();
    object.insert(CONTENT_MEMBER.to_string(), Json::Array(rows));
    Json::Object(object)
}

fn encode_row(table: &TableDef, row: &Row) -> Json {
    let mut cells: Vec<Json> = table
        .columns
        .iter()
        .map(|c| encode_scalar(row.value(&c.name)))
        .collect();
    for child in &table.children {
        let rows = row
            .child_rows(&child.name)
            .iter()
            .map(|r| encode_row(child, r))
            .collect();
        cells.push(Json::Array(rows));
    }
    Json::Array(cells)
}

/// Decodes dense JSON into a daton.
///
/// Short rows are tolerated: missing trailing cells become null or the type
/// default, missing child arrays become empty.
pub fn from_dense(def: &DatonDef, json: &Json, strict: bool) -> CoreResult<Daton> {
    let object = as_object(json, "daton")?;
    let (key, version) = read_header(def, object)?;
    if strict {
        if let Some(unknown) = object
            .keys()
            .find(|k| *k != KEY_MEMBER && *k != VERSION_MEMBER && *k != CONTENT_MEMBER)
        {
            return Err(CoreError::UnexpectedKey {
                key: unknown.clone(),
            });
        }
    }
    let rows = match object.get(CONTENT_MEMBER) {
        None | Some(Json::Null) => Vec::new(),
        Some(content) => as_array(content, CONTENT_MEMBER)?
            .iter()
            .map(|r| decode_row(&def.main_table, r))
            .collect::<CoreResult<_>>()?,
    };
    let daton = Daton { key, version, rows };
    daton.check_shape(def)?;
    Ok(daton)
}

fn decode_row(table: &TableDef, json: &Json) -> CoreResult<Row> {
    let cells = as_array(json, &table.name)?;
    let width = table.columns.len() + table.children.len();
    if cells.len() > width {
        return Err(CoreError::invalid_wire(format!(
            "{} row has {} cells, expected at most {width}",
            table.name,
            cells.len()
        )));
    }
    let mut row = Row::new();
    for (i, col) in table.columns.iter().enumerate() {
        let value = match cells.get(i) {
            Some(v) => decode_scalar(v, col)?,
            None => missing_value(col),
        };
        row.cells.insert(col.name.clone(), value);
    }
    for (i, child) in table.children.iter().enumerate() {
        let rows = match cells.get(table.columns.len() + i) {
            None | Some(Json::Null) => Vec::new(),
            Some(items) => as_array(items, &child.name)?
                .iter()
                .map(|r| decode_row(child, r))
                .collect::<CoreResult<_>>()?,
        };
        row.children.insert(child.name.clone(), rows);
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::DatonKey;
    use crate::schema::ColDef;
    use crate::value::{Value, WireType};
    use crate::wire::verbose;
    use serde_json::json;

    fn phone_types() -> DatonDef {
        DatonDef::whole_table(
            "PhoneType",
            TableDef::new("PhoneType")
                .primary_key("PhoneTypeId")
                .column(ColDef::new("PhoneTypeId", WireType::Int32))
                .column(ColDef::new("TypeOfPhone", WireType::Text))
                .child(
                    TableDef::new("PhoneTypeAlias")
                        .primary_key("AliasId")
                        .parent_key("PhoneTypeId")
                        .column(ColDef::new("AliasId", WireType::Int32))
                        .column(ColDef::new("PhoneTypeId", WireType::Int32))
                        .column(ColDef::new("Alias", WireType::Text)),
                ),
        )
        .build()
        .unwrap()
    }

    #[test]
    fn positional_layout() {
        let def = phone_types();
        let daton = Daton::new(
            DatonKey::whole_table("PhoneType"),
            vec![
                Row::new()
                    .with("PhoneTypeId", 1)
                    .with("TypeOfPhone", "Mobile")
                    .with_child(
                        "PhoneTypeAlias",
                        Row::new().with("AliasId", 7).with("PhoneTypeId", 1).with("Alias", "Cell"),
                    ),
                Row::new().with("PhoneTypeId", 2).with("TypeOfPhone", "Home"),
            ],
        )
        .with_version("v9");
        let json = to_dense(&def, &daton);
        assert_eq!(
            json,
            json!({
                "Key": "PhoneType|+",
                "Version": "v9",
                "Content": [[1, "Mobile", [[7, 1, "Cell"]]], [2, "Home", []]]
            })
        );
        let back = from_dense(&def, &json, true).unwrap();
        assert_eq!(back, daton);
    }

    #[test]
    fn dense_and_verbose_agree() {
        let def = phone_types();
        let verbose_json = json!({
            "Key": "PhoneType|+",
            "Version": "v1",
            "PhoneType": [{"PhoneTypeId": 4, "TypeOfPhone": "Fax", "PhoneTypeAlias": []}]
        });
        let daton = verbose::from_verbose(&def, &verbose_json, true).unwrap();
        let dense_json = to_dense(&def, &daton);
        assert_eq!(from_dense(&def, &dense_json, true).unwrap(), daton);
        assert_eq!(verbose::to_verbose(&def, &daton), verbose_json);
    }

    #[test]
    fn short_and_long_rows() {
        let def = phone_types();
        let short = json!({"Key": "PhoneType|+", "Content": [[5]]});
        let daton = from_dense(&def, &short, false).unwrap();
        assert_eq!(daton.rows[0].value("TypeOfPhone"), &Value::from(""));

        let long = json!({"Key": "PhoneType|+", "Content": [[5, "x", [], "extra"]]});
        assert!(from_dense(&def, &long, false).is_err());
    }
}
