//! Typed cell values and their wire types.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// The wire type of a column.
///
/// The wire type decides how a value is formatted in JSON and which Rust
/// variant of [`Value`] a column holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireType {
    /// `true` / `false`.
    Bool,
    /// 32-bit integer.
    Int32,
    /// 64-bit integer.
    Int64,
    /// Exact decimal number.
    Decimal,
    /// UTF-8 text.
    #[serde(rename = "string")]
    Text,
    /// Calendar date, `yyyy-MM-dd`.
    Date,
    /// UTC timestamp, ISO-8601.
    #[serde(rename = "datetime")]
    DateTime,
}

impl WireType {
    /// Returns the wire name used in the data dictionary.
    pub fn wire_name(&self) -> &'static str {
        match self {
            WireType::Bool => "bool",
            WireType::Int32 => "int32",
            WireType::Int64 => "int64",
            WireType::Decimal => "decimal",
            WireType::Text => "string",
            WireType::Date => "date",
            WireType::DateTime => "datetime",
        }
    }

    /// Returns true for the integer and decimal types.
    pub fn is_numeric(&self) -> bool {
        matches!(self, WireType::Int32 | WireType::Int64 | WireType::Decimal)
    }

    /// Returns the value used when a non-nullable column is missing on decode.
    pub fn default_value(&self) -> Value {
        match self {
            WireType::Bool => Value::Bool(false),
            WireType::Int32 | WireType::Int64 => Value::Int(0),
            WireType::Decimal => Value::Decimal(Decimal::ZERO),
            WireType::Text => Value::Text(String::new()),
            WireType::Date => Value::Date(DateTime::<Utc>::default().date_naive()),
            WireType::DateTime => Value::DateTime(DateTime::<Utc>::default()),
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// An exact decimal number stored as `units * 10^-scale`.
///
/// Values are kept normalized (no trailing fractional zeros), so derived
/// equality is value equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    units: i128,
    scale: u32,
}

impl Decimal {
    /// Zero.
    pub const ZERO: Decimal = Decimal { units: 0, scale: 0 };

    /// Largest scale accepted from text: the digits an `i128` can hold.
    pub const MAX_SCALE: u32 = 38;

    /// Creates a decimal from unscaled units and a scale.
    pub fn new(units: i128, scale: u32) -> Self {
        Self { units, scale }.normalized()
    }

    /// Creates a whole-number decimal.
    pub fn from_i64(value: i64) -> Self {
        Self {
            units: i128::from(value),
            scale: 0,
        }
    }

    /// Returns the unscaled units.
    pub fn units(&self) -> i128 {
        self.units
    }

    /// Returns the number of fractional digits.
    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Returns true if there is no fractional part.
    pub fn is_integer(&self) -> bool {
        self.scale == 0
    }

    /// Lossy conversion to `f64`.
    pub fn to_f64(&self) -> f64 {
        self.units as f64 / 10f64.powi(self.scale as i32)
    }

    fn normalized(mut self) -> Self {
        while self.scale > 0 && self.units % 10 == 0 {
            self.units /= 10;
            self.scale -= 1;
        }
        if self.units == 0 {
            self.scale = 0;
        }
        self
    }

    fn rescaled_units(&self, scale: u32) -> Option<i128> {
        10i128
            .checked_pow(scale - self.scale)
            .and_then(|factor| self.units.checked_mul(factor))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let scale = self.scale.max(other.scale);
        match (self.rescaled_units(scale), other.rescaled_units(scale)) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self
                .to_f64()
                .partial_cmp(&other.to_f64())
                .unwrap_or(Ordering::Equal),
        }
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Decimal {
    type Err = CoreError;

    fn from_str(text: &str) -> CoreResult<Self> {
        let invalid = || CoreError::invalid_wire(format!("invalid decimal: {text:?}"));
        let text = text.trim();
        let (mantissa, exponent) = match text.find(|c: char| c == 'e' || c == 'E') {
            Some(pos) => {
                let exp: i32 = text[pos + 1..].parse().map_err(|_| invalid())?;
                (&text[..pos], exp)
            }
            None => (text, 0),
        };
        let (negative, digits) = match mantissa.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, mantissa.strip_prefix('+').unwrap_or(mantissa)),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        let mut units: i128 = 0;
        for c in whole.chars().chain(fraction.chars()) {
            units = units
                .checked_mul(10)
                .and_then(|u| u.checked_add(i128::from(c as u8 - b'0')))
                .ok_or_else(invalid)?;
        }
        if units == 0 {
            return Ok(Decimal::ZERO);
        }
        let mut scale = fraction.len() as i64 - i64::from(exponent);
        while scale < 0 {
            units = units.checked_mul(10).ok_or_else(invalid)?;
            scale += 1;
        }
        let scale = u32::try_from(scale).map_err(|_| invalid())?;
        if negative {
            units = -units;
        }
        let decimal = Decimal::new(units, scale);
        if decimal.scale > Self::MAX_SCALE {
            return Err(invalid());
        }
        Ok(decimal)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.units);
        }
        let digits = self.units.unsigned_abs().to_string();
        let scale = self.scale as usize;
        let sign = if self.units < 0 { "-" } else { "" };
        if digits.len() > scale {
            let (whole, fraction) = digits.split_at(digits.len() - scale);
            write!(f, "{sign}{whole}.{fraction}")
        } else {
            write!(f, "{sign}0.{}{digits}", "0".repeat(scale - digits.len()))
        }
    }
}

/// A typed cell value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Value {
    /// Null / missing value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer (both 32- and 64-bit columns).
    Int(i64),
    /// Exact decimal.
    Decimal(Decimal),
    /// Text.
    Text(String),
    /// Calendar date.
    Date(NaiveDate),
    /// UTC timestamp.
    DateTime(DateTime<Utc>),
}

impl Value {
    /// Returns true if the value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the integer value, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text value, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean value, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the numeric value as a decimal, if the value is numeric.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Int(v) => Some(Decimal::from_i64(*v)),
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Returns true if this value may be stored in a column of `wire_type`.
    pub fn conforms_to(&self, wire_type: WireType) -> bool {
        match (self, wire_type) {
            (Value::Null, _) => true,
            (Value::Bool(_), WireType::Bool) => true,
            (Value::Int(v), WireType::Int32) => i32::try_from(*v).is_ok(),
            (Value::Int(_), WireType::Int64) => true,
            (Value::Decimal(_), WireType::Decimal) | (Value::Int(_), WireType::Decimal) => true,
            (Value::Text(_), WireType::Text) => true,
            (Value::Date(_), WireType::Date) => true,
            (Value::DateTime(_), WireType::DateTime) => true,
            _ => false,
        }
    }

    /// Formats the value as it appears inside a daton key segment.
    pub fn to_key_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Text(s) => s.clone(),
            Value::Date(d) => d.format(crate::wire::DATE_FORMAT).to_string(),
            Value::DateTime(dt) => crate::wire::format_datetime(dt),
        }
    }

    /// Parses a daton key segment value as a value of `wire_type`.
    pub fn from_key_text(text: &str, wire_type: WireType) -> CoreResult<Value> {
        let mismatch = || CoreError::malformed_key(format!("{text:?} is not a valid {wire_type}"));
        Ok(match wire_type {
            WireType::Bool => Value::Bool(text.parse().map_err(|_| mismatch())?),
            WireType::Int32 | WireType::Int64 => Value::Int(text.parse().map_err(|_| mismatch())?),
            WireType::Decimal => Value::Decimal(text.parse().map_err(|_| mismatch())?),
            WireType::Text => Value::Text(text.to_string()),
            WireType::Date => Value::Date(
                NaiveDate::parse_from_str(text, crate::wire::DATE_FORMAT).map_err(|_| mismatch())?,
            ),
            WireType::DateTime => {
                Value::DateTime(crate::wire::parse_datetime(text).map_err(|_| mismatch())?)
            }
        })
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
