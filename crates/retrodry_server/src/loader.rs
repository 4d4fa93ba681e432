//! Reads datons out of the SQL database.

use crate::error::{ServerError, ServerResult};
use retrodry_core::{Daton, DatonDef, DatonKey, DatonKind, Row, TableDef, Value};
use retrodry_storage::{RowQuery, SqlDatabase, StoredRow};
use std::sync::Arc;

/// Loads whole datons: main rows by key, criteria or whole table, then
/// child rows by parent key.
#[derive(Clone)]
pub struct DatonLoader {
    database: Arc<dyn SqlDatabase>,
}

impl DatonLoader {
    /// Creates a loader over `database`.
    pub fn new(database: Arc<dyn SqlDatabase>) -> Self {
        Self { database }
    }

    /// Loads the daton for `key`. Returns `None` if a single-row persiston
    /// does not exist; whole-table persistons and viewons may be empty.
    pub fn load(&self, def: &DatonDef, key: &DatonKey) -> ServerResult<Option<Daton>> {
        let table = &def.main_table;
        let query = match def.kind {
            DatonKind::SingleRowPersiston => {
                let pk = def
                    .main_key_value(key)?
                    .ok_or_else(|| ServerError::InvalidRequest(format!("{key} has no row key")))?;
                RowQuery::table(&table.sql_table).filter(primary_key(table)?, pk)
            }
            DatonKind::WholeTablePersiston => {
                let mut query = RowQuery::table(&table.sql_table);
                if let Some(pk) = &table.primary_key {
                    query = query.order_by(pk);
                }
                query
            }
            DatonKind::Viewon => viewon_query(def, key)?,
        };
        let stored = self.database.select(&query)?;
        if def.is_single_row() && stored.is_empty() {
            return Ok(None);
        }
        let rows = stored
            .iter()
            .map(|r| self.build_row(table, r))
            .collect::<ServerResult<Vec<_>>>()?;
        Ok(Some(Daton::new(key.clone(), rows)))
    }

    fn build_row(&self, table: &TableDef, stored: &StoredRow) -> ServerResult<Row> {
        let mut row = Row::new();
        for col in &table.columns {
            row.set(col.name.clone(), stored.get(&col.name).cloned().unwrap_or(Value::Null));
        }
        if table.children.is_empty() {
            return Ok(row);
        }
        let key = table.primary_key_of(&row).cloned();
        for child in &table.children {
            let rows = match (&key, &child.parent_key) {
                (Some(key), Some(parent_key)) => {
                    let mut query = RowQuery::table(&child.sql_table).filter(parent_key, key.clone());
                    if let Some(pk) = &child.primary_key {
                        query = query.order_by(pk);
                    }
                    self.database
                        .select(&query)?
                        .iter()
                        .map(|r| self.build_row(child, r))
                        .collect::<ServerResult<Vec<_>>>()?
                }
                _ => Vec::new(),
            };
            row.children.insert(child.name.clone(), rows);
        }
        Ok(row)
    }
}

fn primary_key(table: &TableDef) -> ServerResult<&str> {
    table
        .primary_key
        .as_deref()
        .ok_or_else(|| ServerError::Internal(format!("table {} has no primary key", table.name)))
}

fn viewon_query(def: &DatonDef, key: &DatonKey) -> ServerResult<RowQuery> {
    let table = &def.main_table;
    let mut query = RowQuery::table(&table.sql_table);
    for criterion in key.criteria() {
        let col = def
            .criteria
            .as_ref()
            .and_then(|c| c.column_def(&criterion.name))
            .ok_or_else(|| ServerError::InvalidRequest(format!("{} is not a criterion of {}", criterion.name, def.name)))?;
        query = query.filter(&criterion.name, Value::from_key_text(&criterion.value, col.wire_type)?);
    }
    match key.sort_column() {
        Some(column) => {
            if !table.column_def(column).is_some_and(|c| c.sort_column) {
                return Err(ServerError::InvalidRequest(format!("{} cannot sort by {column}", def.name)));
            }
            query = query.order_by(column);
        }
        None => {
            if let Some(pk) = &table.primary_key {
                query = query.order_by(pk);
            }
        }
    }
    if let Some(size) = def.page_size {
        query = query.page(key.page() * size, size);
    }
    Ok(query)
}
