//! SQL executor abstraction.

use crate::error::StorageResult;
use retrodry_core::{SqlCommand, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A row read back from the database, column name to value.
pub type StoredRow = BTreeMap<String, Value>;

/// Keyed, filtered read of one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowQuery {
    /// SQL table name.
    pub table: String,
    /// Equality filters, all of which must match.
    pub filters: Vec<(String, Value)>,
    /// Sort column.
    pub order_by: Option<String>,
    /// Rows to skip.
    pub offset: usize,
    /// Maximum rows to return.
    pub limit: Option<usize>,
}

impl RowQuery {
    /// Query of every row of a table.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Adds an equality filter.
    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    /// Sets the sort column.
    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by = Some(column.into());
        self
    }

    /// Sets offset and limit.
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// Returns true if the row passes every filter.
    pub fn matches(&self, row: &StoredRow) -> bool {
        self.filters
            .iter()
            .all(|(column, value)| row.get(column).map_or(value.is_null(), |v| values_equal(v, value)))
    }
}

/// A database that runs [`SqlCommand`]s in transactions.
///
/// Implementations must not let a reader observe a transaction's writes
/// before `commit` returns.
pub trait SqlDatabase: Send + Sync {
    /// Starts a transaction.
    fn begin(&self) -> StorageResult<Box<dyn SqlTransaction>>;

    /// Reads rows.
    fn select(&self, query: &RowQuery) -> StorageResult<Vec<StoredRow>>;
}

/// An open transaction. Dropping it without `commit` rolls back.
pub trait SqlTransaction: Send {
    /// Runs a command; inserts return the generated key.
    fn execute(&mut self, command: &SqlCommand) -> StorageResult<Option<Value>>;

    /// Commits every command run so far.
    fn commit(self: Box<Self>) -> StorageResult<()>;
}

/// Total order over values used for sorting query results.
///
/// Nulls sort first; numbers compare numerically across integer and decimal.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    use Value::*;
    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Bool(x), Bool(y)) => x.cmp(y),
        (Text(x), Text(y)) => x.cmp(y),
        (Date(x), Date(y)) => x.cmp(y),
        (DateTime(x), DateTime(y)) => x.cmp(y),
        _ => match (a.as_decimal(), b.as_decimal()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => rank(a).cmp(&rank(b)),
        },
    }
}

/// Equality that treats `Int(2)` and `Decimal(2)` as the same key.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || compare_values(a, b) == Ordering::Equal && !a.is_null() && rank(a) == rank(b)
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Decimal(_) => 2,
        Value::Text(_) => 3,
        Value::Date(_) => 4,
        Value::DateTime(_) => 5,
    }
}
