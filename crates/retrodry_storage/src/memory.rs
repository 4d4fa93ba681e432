//! In-memory SQL database for tests and single-process deployments.

use crate::database::{compare_values, values_equal, RowQuery, SqlDatabase, SqlTransaction, StoredRow};
use crate::error::{StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use retrodry_core::{CommandKind, SqlCommand, Value};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
struct Table {
    rows: Vec<StoredRow>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: RwLock<HashMap<String, Table>>,
    next_keys: Mutex<HashMap<String, i64>>,
    commit_failure: Mutex<Option<String>>,
}

/// An in-memory database that interprets [`SqlCommand`]s structurally.
///
/// Commands run inside a transaction are buffered and applied atomically at
/// commit under the write lock, so readers never see a partial transaction.
/// Inserts get integer keys from a per-table counter.
///
/// Cloning yields another handle to the same data.
///
/// # Example
///
/// ```rust
/// use retrodry_storage::{InMemoryDatabase, RowQuery, SqlDatabase};
/// use retrodry_core::Value;
///
/// let db = InMemoryDatabase::new();
/// db.create_table("Widget");
/// db.seed("Widget", "WidgetId", [("ItemCode", Value::from("HEXNUT"))]);
/// let rows = db.select(&RowQuery::table("Widget")).unwrap();
/// assert_eq!(rows[0]["WidgetId"], Value::Int(1));
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryDatabase {
    inner: Arc<Inner>,
}

impl InMemoryDatabase {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty table if it does not exist.
    pub fn create_table(&self, name: &str) {
        self.inner
            .tables
            .write()
            .entry(name.to_string())
            .or_default();
    }

    /// Inserts a row outside any transaction and returns its generated key.
    pub fn seed<I, C>(&self, table: &str, key_column: &str, cells: I) -> Value
    where
        I: IntoIterator<Item = (C, Value)>,
        C: Into<String>,
    {
        let key = Value::Int(self.next_key(table));
        let mut row: StoredRow = cells.into_iter().map(|(c, v)| (c.into(), v)).collect();
        row.insert(key_column.to_string(), key.clone());
        self.inner
            .tables
            .write()
            .entry(table.to_string())
            .or_default()
            .rows
            .push(row);
        key
    }

    /// Makes the next commit fail with a backend error carrying `message`.
    pub fn fail_next_commit(&self, message: impl Into<String>) {
        *self.inner.commit_failure.lock() = Some(message.into());
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.inner
            .tables
            .read()
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    fn next_key(&self, table: &str) -> i64 {
        let mut keys = self.inner.next_keys.lock();
        let next = keys.entry(table.to_string()).or_insert(0);
        *next += 1;
        *next
    }
}

impl SqlDatabase for InMemoryDatabase {
    fn begin(&self) -> StorageResult<Box<dyn SqlTransaction>> {
        Ok(Box::new(MemoryTransaction {
            db: self.clone(),
            pending: Vec::new(),
        }))
    }

    fn select(&self, query: &RowQuery) -> StorageResult<Vec<StoredRow>> {
        let tables = self.inner.tables.read();
        let table = tables
            .get(&query.table)
            .ok_or_else(|| StorageError::UnknownTable(query.table.clone()))?;
        let mut rows: Vec<StoredRow> = table
            .rows
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        if let Some(column) = &query.order_by {
            rows.sort_by(|a, b| {
                compare_values(
                    a.get(column).unwrap_or(&Value::Null),
                    b.get(column).unwrap_or(&Value::Null),
                )
            });
        }
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(query.offset).take(limit).collect())
    }
}

struct MemoryTransaction {
    db: InMemoryDatabase,
    pending: Vec<SqlCommand>,
}

impl SqlTransaction for MemoryTransaction {
    fn execute(&mut self, command: &SqlCommand) -> StorageResult<Option<Value>> {
        if !self.db.inner.tables.read().contains_key(&command.table) {
            return Err(StorageError::UnknownTable(command.table.clone()));
        }
        let mut command = command.clone();
        let generated = match command.kind {
            CommandKind::Insert => {
                let key = Value::Int(self.db.next_key(&command.table));
                command.key_value = Some(key.clone());
                Some(key)
            }
            CommandKind::Update | CommandKind::Delete => None,
        };
        self.pending.push(command);
        Ok(generated)
    }

    fn commit(self: Box<Self>) -> StorageResult<()> {
        if let Some(message) = self.db.inner.commit_failure.lock().take() {
            return Err(StorageError::Backend(message));
        }
        let mut tables = self.db.inner.tables.write();
        let mut staged = tables.clone();
        for command in &self.pending {
            apply(&mut staged, command)?;
        }
        *tables = staged;
        Ok(())
    }
}

fn apply(tables: &mut HashMap<String, Table>, command: &SqlCommand) -> StorageResult<()> {
    let table = tables
        .get_mut(&command.table)
        .ok_or_else(|| StorageError::UnknownTable(command.table.clone()))?;
    let key = command.key_value.clone().unwrap_or(Value::Null);
    match command.kind {
        CommandKind::Insert => {
            let mut row: StoredRow = command
                .columns
                .iter()
                .cloned()
                .zip(command.params.iter().cloned())
                .collect();
            row.insert(command.key_column.clone(), key);
            table.rows.push(row);
        }
        CommandKind::Update => {
            let row = table
                .rows
                .iter_mut()
                .find(|r| r.get(&command.key_column).is_some_and(|v| values_equal(v, &key)))
                .ok_or_else(|| not_found(command, &key))?;
            for (column, value) in command.columns.iter().zip(&command.params) {
                row.insert(column.clone(), value.clone());
            }
        }
        CommandKind::Delete => {
            let before = table.rows.len();
            table
                .rows
                .retain(|r| !r.get(&command.key_column).is_some_and(|v| values_equal(v, &key)));
            if table.rows.len() == before {
                return Err(not_found(command, &key));
            }
        }
    }
    Ok(())
}

fn not_found(command: &SqlCommand, key: &Value) -> StorageError {
    StorageError::RowNotFound {
        table: command.table.clone(),
        column: command.key_column.clone(),
        key: key.to_key_text(),
    }
}
