//! JSON wire codec.
//!
//! Three encodings share the scalar rules in this module:
//! - verbose: named objects, `{Key, Version, <MainTable>: ...}`
//! - dense: positional arrays, `{Key, Version, Content: [[...]]}`
//! - diff JSON: verbose names plus `<Table>-new` / `<Table>-deleted`
//!
//! The data dictionary export lives in [`dictionary`].

pub mod dense;
pub mod dictionary;
pub mod diff_json;
pub mod verbose;

use crate::daton::Daton;
use crate::error::{CoreError, CoreResult};
use crate::schema::{ColDef, DatonDef};
use crate::value::{Decimal, Value, WireType};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as Json};
use std::str::FromStr;

/// Member holding the daton key.
pub const KEY_MEMBER: &str = "Key";
/// Member holding the version token.
pub const VERSION_MEMBER: &str = "Version";
/// Member holding dense row content.
pub const CONTENT_MEMBER: &str = "Content";
/// Suffix of the diff JSON member listing new rows.
pub const NEW_SUFFIX: &str = "-new";
/// Suffix of the diff JSON member listing deleted rows.
pub const DELETED_SUFFIX: &str = "-deleted";

/// Date format on the wire.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Which daton encoding to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Encoding {
    /// Named JSON.
    #[default]
    Verbose,
    /// Positional JSON.
    Dense,
}

/// Formats a timestamp as ISO-8601 UTC, with fractional seconds only when present.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.format(DATETIME_FORMAT).to_string()
}

/// Parses an ISO-8601 timestamp; a missing offset is read as UTC.
pub fn parse_datetime(text: &str) -> CoreResult<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| CoreError::invalid_wire(format!("invalid date-time {text:?}")))
}

/// Encodes a scalar value.
pub fn encode_scalar(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(v) => Json::Number(Number::from(*v)),
        Value::Decimal(d) => encode_decimal(d),
        Value::Text(s) => Json::String(s.clone()),
        Value::Date(d) => Json::String(d.format(DATE_FORMAT).to_string()),
        Value::DateTime(dt) => Json::String(format_datetime(dt)),
    }
}

// Numbers keep their exact digits on the wire.
fn encode_decimal(d: &Decimal) -> Json {
    let text = d.to_string();
    match Number::from_str(&text) {
        Ok(number) => Json::Number(number),
        Err(_) => Json::String(text),
    }
}

/// Decodes a scalar value for a column.
pub fn decode_scalar(json: &Json, col: &ColDef) -> CoreResult<Value> {
    let mismatch = || CoreError::type_mismatch(&col.name, col.wire_type.wire_name());
    if json.is_null() {
        return Ok(Value::Null);
    }
    let value = match col.wire_type {
        WireType::Bool => Value::Bool(json.as_bool().ok_or_else(mismatch)?),
        WireType::Int32 => {
            let v = json.as_i64().ok_or_else(mismatch)?;
            i32::try_from(v).map_err(|_| mismatch())?;
            Value::Int(v)
        }
        WireType::Int64 => Value::Int(json.as_i64().ok_or_else(mismatch)?),
        WireType::Decimal => Value::Decimal(match json {
            Json::Number(n) => n.to_string().parse().map_err(|_| mismatch())?,
            Json::String(s) => s.parse().map_err(|_| mismatch())?,
            _ => return Err(mismatch()),
        }),
        WireType::Text => Value::Text(json.as_str().ok_or_else(mismatch)?.to_string()),
        WireType::Date => {
            let text = json.as_str().ok_or_else(mismatch)?;
            Value::Date(NaiveDate::parse_from_str(text, DATE_FORMAT).map_err(|_| mismatch())?)
        }
        WireType::DateTime => {
            let text = json.as_str().ok_or_else(mismatch)?;
            Value::DateTime(parse_datetime(text).map_err(|_| mismatch())?)
        }
    };
    Ok(value)
}

/// Value substituted for a column missing from the JSON.
pub(crate) fn missing_value(col: &ColDef) -> Value {
    if col.nullable {
        Value::Null
    } else {
        col.wire_type.default_value()
    }
}

/// Encodes a daton in the requested encoding.
pub fn encode_daton(def: &DatonDef, daton: &Daton, encoding: Encoding) -> Json {
    match encoding {
        Encoding::Verbose => verbose::to_verbose(def, daton),
        Encoding::Dense => dense::to_dense(def, daton),
    }
}

/// Decodes a daton, choosing the encoding from the presence of `Content`.
pub fn decode_daton(def: &DatonDef, json: &Json, strict: bool) -> CoreResult<Daton> {
    match json.get(CONTENT_MEMBER) {
        Some(_) => dense::from_dense(def, json, strict),
        None => verbose::from_verbose(def, json, strict),
    }
}

/// Parses daton JSON text, choosing the encoding from its shape.
pub fn decode_daton_str(def: &DatonDef, text: &str, strict: bool) -> CoreResult<Daton> {
    let json: Json = serde_json::from_str(text)?;
    decode_daton(def, &json, strict)
}

/// Reads the `Key` member of a daton or diff document without decoding the rest.
pub fn peek_key(json: &Json) -> CoreResult<crate::key::DatonKey> {
    json.get(KEY_MEMBER)
        .and_then(Json::as_str)
        .ok_or_else(|| CoreError::invalid_wire("missing Key"))?
        .parse()
}

pub(crate) fn as_object<'a>(json: &'a Json, what: &str) -> CoreResult<&'a Map<String, Json>> {
    json.as_object()
        .ok_or_else(|| CoreError::invalid_wire(format!("{what} must be an object")))
}

pub(crate) fn as_array<'a>(json: &'a Json, what: &str) -> CoreResult<&'a Vec<Json>> {
    json.as_array()
        .ok_or_else(|| CoreError::invalid_wire(format!("{what} must be an array")))
}

/// Reads `Key` and `Version`, checking the key belongs to `def`.
pub(crate) fn read_header(
    def: &DatonDef,
    object: &Map<String, Json>,
) -> CoreResult<(crate::key::DatonKey, Option<String>)> {
    let key = object
        .get(KEY_MEMBER)
        .and_then(Json::as_str)
        .ok_or_else(|| CoreError::invalid_wire("missing Key"))?
        .parse::<crate::key::DatonKey>()?;
    if key.type_name() != def.name {
        return Err(CoreError::invalid_wire(format!(
            "key {key} does not belong to {}",
            def.name
        )));
    }
    let version = match object.get(VERSION_MEMBER) {
        None | Some(Json::Null) => None,
        Some(Json::String(v)) => Some(v.clone()),
        Some(_) => return Err(CoreError::invalid_wire("Version must be a string")),
    };
    Ok((key, version))
}

pub(crate) fn write_header(object: &mut Map<String, Json>, key: &crate::key::DatonKey, version: &Option<String>) {
    object.insert(KEY_MEMBER.to_string(), Json::String(key.to_string()));
    object.insert(
        VERSION_MEMBER.to_string(),
        version.clone().map(Json::String).unwrap_or(Json::Null),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn scalar_formatting() {
        assert_eq!(encode_scalar(&Value::Null), json!(null));
        assert_eq!(encode_scalar(&Value::Bool(true)), json!(true));
        assert_eq!(encode_scalar(&Value::Int(-42)), json!(-42));
        let d: Decimal = "12.50".parse().unwrap();
        assert_eq!(serde_json::to_string(&encode_scalar(&d.into())).unwrap(), "12.5");
        assert_eq!(encode_scalar(&Decimal::from_i64(3).into()).to_string(), "3");
        assert_eq!(
            encode_scalar(&Value::from("say \"hi\"")).to_string(),
            r#""say \"hi\"""#
        );
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(encode_scalar(&date.into()), json!("2024-02-29"));
        let dt = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(encode_scalar(&dt.into()), json!("2024-01-02T03:04:05Z"));
    }

    #[test]
    fn datetime_parsing() {
        let dt = parse_datetime("2024-01-02T03:04:05.250Z").unwrap();
        assert_eq!(format_datetime(&dt), "2024-01-02T03:04:05.250Z");
        let offset = parse_datetime("2024-01-02T05:04:05+02:00").unwrap();
        assert_eq!(format_datetime(&offset), "2024-01-02T03:04:05Z");
        assert!(parse_datetime("2024-01-02").is_err());
    }

    #[test]
    fn scalar_decoding_checks_types() {
        let col = ColDef::new("Qty", WireType::Int32);
        assert_eq!(decode_scalar(&json!(7), &col).unwrap(), Value::Int(7));
        assert!(matches!(
            decode_scalar(&json!("7"), &col),
            Err(CoreError::TypeMismatch { .. })
        ));
        assert!(decode_scalar(&json!(5_000_000_000i64), &col).is_err());

        let price = ColDef::new("Price", WireType::Decimal);
        assert_eq!(
            decode_scalar(&json!(12.5), &price).unwrap(),
            Value::Decimal("12.5".parse().unwrap())
        );
        assert_eq!(
            decode_scalar(&json!("0.10"), &price).unwrap(),
            Value::Decimal("0.1".parse().unwrap())
        );
    }

    #[test]
    fn decimals_keep_every_digit() {
        let price = ColDef::new("Price", WireType::Decimal);
        for text in ["0.0000001", "12345678901234567.89", "1234567890123456789", "-0.1234567"] {
            let value = Value::Decimal(text.parse().unwrap());
            let wire = serde_json::to_string(&encode_scalar(&value)).unwrap();
            assert_eq!(wire, text);
            let json: Json = serde_json::from_str(&wire).unwrap();
            assert_eq!(decode_scalar(&json, &price).unwrap(), value);
        }
        assert!(decode_scalar(&json!("1e-400"), &price).is_err());
        assert!(decode_scalar(&serde_json::from_str("1e-400").unwrap(), &price).is_err());
    }
}
