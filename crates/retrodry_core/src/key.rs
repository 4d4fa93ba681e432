//! Daton keys: the escaped string identity of a daton instance.
//!
//! Grammar: `TypeName|segment|segment...`. Inside a segment `\` is written as
//! `\\` and `|` as `\|`. A persiston has exactly one segment, `+` for the whole
//! table or `=<value>` for a single row. A viewon has zero or more
//! `name=value` segments, emitted as `_page`, then `_sort`, then the rest by
//! name.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Segment name carrying the viewon page number.
pub const PAGE_SEGMENT: &str = "_page";
/// Segment name carrying the viewon sort column.
pub const SORT_SEGMENT: &str = "_sort";

/// One `name=value` segment of a viewon key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Criterion {
    /// Segment name (a criteria column, `_page` or `_sort`).
    pub name: String,
    /// Unescaped value text.
    pub value: String,
}

impl Criterion {
    /// Creates a criterion.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    fn rank(&self) -> u8 {
        match self.name.as_str() {
            PAGE_SEGMENT => 0,
            SORT_SEGMENT => 1,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum KeyBody {
    WholeTable,
    Row(String),
    Viewon(Vec<Criterion>),
}

/// Identity of one daton instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatonKey {
    type_name: String,
    body: KeyBody,
}

impl DatonKey {
    /// Key of a whole-table persiston (`Type|+`).
    pub fn whole_table(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            body: KeyBody::WholeTable,
        }
    }

    /// Key of a single-row persiston (`Type|=value`).
    pub fn row(type_name: impl Into<String>, primary_key: impl fmt::Display) -> Self {
        Self {
            type_name: type_name.into(),
            body: KeyBody::Row(primary_key.to_string()),
        }
    }

    /// Key of a viewon. Segments are put in canonical order.
    pub fn viewon(type_name: impl Into<String>, criteria: impl IntoIterator<Item = Criterion>) -> Self {
        let mut criteria: Vec<Criterion> = criteria.into_iter().collect();
        criteria.sort_by(|a, b| a.rank().cmp(&b.rank()).then_with(|| a.name.cmp(&b.name)));
        Self {
            type_name: type_name.into(),
            body: KeyBody::Viewon(criteria),
        }
    }

    /// Parses a key string.
    pub fn parse(text: &str) -> CoreResult<Self> {
        let mut parts = split_segments(text)?.into_iter();
        let type_name = parts.next().unwrap_or_default();
        if type_name.is_empty() {
            return Err(CoreError::malformed_key("empty type name"));
        }
        let segments: Vec<String> = parts.collect();

        if let [only] = segments.as_slice() {
            if only == "+" {
                return Ok(Self::whole_table(type_name));
            }
            if let Some(value) = only.strip_prefix('=') {
                return Ok(Self {
                    type_name,
                    body: KeyBody::Row(value.to_string()),
                });
            }
        }

        let criteria = segments
            .into_iter()
            .map(|segment| match segment.split_once('=') {
                Some((name, value)) if !name.is_empty() => Ok(Criterion::new(name, value)),
                _ => Err(CoreError::malformed_key(format!(
                    "segment {segment:?} is not name=value"
                ))),
            })
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self::viewon(type_name, criteria))
    }

    /// Daton type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns true for whole-table and single-row persiston keys.
    pub fn is_persiston(&self) -> bool {
        !matches!(self.body, KeyBody::Viewon(_))
    }

    /// Returns true for a `+` key.
    pub fn is_whole_table(&self) -> bool {
        matches!(self.body, KeyBody::WholeTable)
    }

    /// Returns true if this single-row key carries a negative, client-assigned value.
    pub fn is_new(&self) -> bool {
        self.persiston_key_i64().is_some_and(|v| v < 0)
    }

    /// Primary key text of a single-row persiston.
    pub fn persiston_key_str(&self) -> Option<&str> {
        match &self.body {
            KeyBody::Row(value) => Some(value),
            _ => None,
        }
    }

    /// Primary key of a single-row persiston as an integer.
    pub fn persiston_key_i64(&self) -> Option<i64> {
        self.persiston_key_str().and_then(|v| v.parse().ok())
    }

    /// Viewon page number (`_page`), 0 when absent or unparsable.
    pub fn page(&self) -> usize {
        self.segment(PAGE_SEGMENT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Viewon sort column (`_sort`).
    pub fn sort_column(&self) -> Option<&str> {
        self.segment(SORT_SEGMENT)
    }

    /// Viewon criteria, excluding `_page` and `_sort`.
    pub fn criteria(&self) -> impl Iterator<Item = &Criterion> {
        self.all_segments().iter().filter(|c| c.rank() == 2)
    }

    /// Value of a named viewon segment.
    pub fn segment(&self, name: &str) -> Option<&str> {
        self.all_segments()
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value.as_str())
    }

    fn all_segments(&self) -> &[Criterion] {
        match &self.body {
            KeyBody::Viewon(criteria) => criteria,
            _ => &[],
        }
    }
}

fn split_segments(text: &str) -> CoreResult<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ ('\\' | '|')) => current.push(escaped),
                Some(other) => {
                    return Err(CoreError::malformed_key(format!("unknown escape \\{other}")))
                }
                None => return Err(CoreError::malformed_key("truncated escape")),
            },
            '|' => segments.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    segments.push(current);
    Ok(segments)
}

fn write_escaped(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    for c in text.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '|' => f.write_str("\\|")?,
            other => fmt::Write::write_char(f, other)?,
        }
    }
    Ok(())
}

impl fmt::Display for DatonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_escaped(f, &self.type_name)?;
        match &self.body {
            KeyBody::WholeTable => f.write_str("|+"),
            KeyBody::Row(value) => {
                f.write_str("|=")?;
                write_escaped(f, value)
            }
            KeyBody::Viewon(criteria) => {
                for c in criteria {
                    f.write_str("|")?;
                    write_escaped(f, &c.name)?;
                    f.write_str("=")?;
                    write_escaped(f, &c.value)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for DatonKey {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Self::parse(s)
    }
}

impl Serialize for DatonKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DatonKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn escaping_example() {
        let segments = [r"code1=\/", "code3=a=|b|", "code2=|", "_sort=firstName", "_page=3"];
        let key = DatonKey::viewon(
            "CustomerList",
            segments.iter().map(|s| {
                let (name, value) = s.split_once('=').unwrap();
                Criterion::new(name, value)
            }),
        );
        assert_eq!(
            key.to_string(),
            r"CustomerList|_page=3|_sort=firstName|code1=\\/|code2=\||code3=a=\|b\|"
        );
        let parsed: DatonKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.segment("code3"), Some("a=|b|"));
        assert_eq!(parsed.page(), 3);
        assert_eq!(parsed.sort_column(), Some("firstName"));
        assert_eq!(parsed.criteria().count(), 3);
    }

    #[test]
    fn persiston_keys() {
        let key = DatonKey::parse("Customer|=12").unwrap();
        assert!(key.is_persiston());
        assert!(!key.is_new());
        assert_eq!(key.persiston_key_i64(), Some(12));
        assert_eq!(key.to_string(), "Customer|=12");

        let new_key = DatonKey::parse("Customer|=-1").unwrap();
        assert!(new_key.is_new());

        let whole = DatonKey::parse("PhoneType|+").unwrap();
        assert!(whole.is_whole_table());
        assert!(whole.persiston_key_str().is_none());

        let text_key = DatonKey::parse("Code|=a|b").unwrap_err();
        assert!(matches!(text_key, CoreError::MalformedKey { .. }));
        assert_eq!(DatonKey::parse(r"Code|=a\|b").unwrap().persiston_key_str(), Some("a|b"));
    }

    #[test]
    fn viewon_without_segments() {
        let key = DatonKey::parse("CustomerList").unwrap();
        assert!(!key.is_persiston());
        assert_eq!(key.page(), 0);
        assert_eq!(key.to_string(), "CustomerList");
    }

    #[test]
    fn malformed_keys() {
        for bad in ["", "|=1", r"X|a=\", r"X|a=\n", "X|novalue", "X|=1|a=2"] {
            assert!(
                matches!(DatonKey::parse(bad), Err(CoreError::MalformedKey { .. })),
                "{bad:?} should be malformed"
            );
        }
    }

    #[test]
    fn serde_as_string() {
        let key = DatonKey::row("Widget", 9);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"Widget|=9\"");
        let back: DatonKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    fn arb_key() -> impl Strategy<Value = DatonKey> {
        let name = "[A-Za-z][A-Za-z0-9_]{0,8}";
        let text = r"[a-z0-9=|\\/ ]{0,8}";
        prop_oneof![
            name.prop_map(|n| DatonKey::whole_table(n)),
            (name, text).prop_map(|(n, v)| DatonKey::row(n, v)),
            (
                name,
                proptest::collection::vec(("[a-z_][a-z0-9]{0,5}", text), 0..5)
            )
                .prop_map(|(n, segs)| {
                    DatonKey::viewon(n, segs.into_iter().map(|(k, v)| Criterion::new(k, v)))
                }),
        ]
    }

    proptest! {
        #[test]
        fn parse_format_roundtrip(key in arb_key()) {
            let text = key.to_string();
            let parsed = DatonKey::parse(&text).unwrap();
            prop_assert_eq!(parsed, key);
        }
    }
}
