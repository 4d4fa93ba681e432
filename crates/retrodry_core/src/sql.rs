//! SQL write layer: turns a diff into parametrized INSERT, UPDATE and DELETE
//! commands.
//!
//! Commands carry both the SQL text for a real engine and the structured
//! fields (table, columns, parameters, key) an executor can interpret
//! directly.

use crate::daton::{Daton, Row};
use crate::diff::{DiffRow, PersistonDiff, TableDiff};
use crate::error::{CoreError, CoreResult};
use crate::schema::{DatonDef, TableDef};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Statement kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Insert a row and return its generated key.
    Insert,
    /// Update columns of the row matching the key.
    Update,
    /// Delete the row matching the key.
    Delete,
}

/// A parametrized statement.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlCommand {
    /// Statement kind.
    pub kind: CommandKind,
    /// Backing SQL table.
    pub table: String,
    /// SQL text with placeholders.
    pub text: String,
    /// Written columns, matching `params` by position.
    pub columns: Vec<String>,
    /// Bound values. For updates and deletes the key value comes last.
    pub params: Vec<Value>,
    /// Primary key column (filter for updates and deletes, returned for inserts).
    pub key_column: String,
    /// Key value for updates and deletes.
    pub key_value: Option<Value>,
}

/// Vendor adaptation of placeholder, quoting and key-return syntax.
pub trait SqlFlavor: Send + Sync {
    /// Flavor name for logs.
    fn name(&self) -> &'static str;

    /// Placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Quotes an identifier.
    fn quote(&self, ident: &str) -> String;

    /// Builds INSERT text that returns the generated key.
    fn insert_text(&self, table: &str, columns: &[String], key_column: &str) -> String {
        let key = self.quote(key_column);
        if columns.is_empty() {
            return format!("INSERT INTO {} DEFAULT VALUES RETURNING {key}", self.quote(table));
        }
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {key}",
            self.quote(table),
            self.quoted_list(columns),
            self.placeholders(1, columns.len()),
        )
    }

    /// Comma-separated quoted identifiers.
    fn quoted_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Comma-separated placeholders `first..first+count`.
    fn placeholders(&self, first: usize, count: usize) -> String {
        (first..first + count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// PostgreSQL: `$n` placeholders, `RETURNING`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresFlavor;

impl SqlFlavor for PostgresFlavor {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

/// SQLite: `?n` placeholders, `RETURNING`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteFlavor;

impl SqlFlavor for SqliteFlavor {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{index}")
    }

    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

/// SQL Server: `@pn` placeholders, `OUTPUT INSERTED.`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerFlavor;

impl SqlFlavor for SqlServerFlavor {
    fn name(&self) -> &'static str {
        "sqlserver"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@p{index}")
    }

    fn quote(&self, ident: &str) -> String {
        // Dotted names such as dbo.Customer are quoted per part.
        ident
            .split('.')
            .map(|part| format!("[{}]", part.replace(']', "]]")))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn insert_text(&self, table: &str, columns: &[String], key_column: &str) -> String {
        let output = format!("OUTPUT INSERTED.{}", self.quote(key_column));
        if columns.is_empty() {
            return format!("INSERT INTO {} {output} DEFAULT VALUES", self.quote(table));
        }
        format!(
            "INSERT INTO {} ({}) {output} VALUES ({})",
            self.quote(table),
            self.quoted_list(columns),
            self.placeholders(1, columns.len()),
        )
    }
}

/// Rewrites a column value right before it is bound.
///
/// Runs after validation, so it never changes validation results.
pub trait ColumnValueRewriter: Send + Sync {
    /// Returns the value to bind for `table.column`.
    fn rewrite(&self, table: &str, column: &str, value: Value) -> Value;
}

/// Where a new row's parent key comes from.
#[derive(Debug, Clone, PartialEq)]
enum ParentBinding {
    None,
    Known(Value),
    Insert(usize),
}

/// One ordered write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteStep {
    /// Schema table name.
    pub table_name: String,
    /// The command to run.
    pub command: SqlCommand,
    /// For child inserts under a new parent: index of the parent's insert step
    /// and of the parameter that receives its generated key.
    pub parent_insert: Option<(usize, usize)>,
    /// True for the insert of a new single-row persiston's main row.
    pub is_main_insert: bool,
}

impl WriteStep {
    /// Binds the generated parent key, given the keys generated so far by step index.
    pub fn bind_parent(&mut self, generated: &[Option<Value>]) -> CoreResult<()> {
        if let Some((step, param)) = self.parent_insert {
            let key = generated
                .get(step)
                .and_then(Option::clone)
                .ok_or_else(|| CoreError::diff_mismatch(format!("parent key of step {step} not generated")))?;
            if let Some(slot) = self.command.params.get_mut(param) {
                *slot = key;
            }
        }
        Ok(())
    }
}

/// Builds commands for a flavor.
#[derive(Clone)]
pub struct SqlWriter {
    flavor: Arc<dyn SqlFlavor>,
    rewriter: Option<Arc<dyn ColumnValueRewriter>>,
}

impl fmt::Debug for SqlWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlWriter")
            .field("flavor", &self.flavor.name())
            .field("rewriter", &self.rewriter.is_some())
            .finish()
    }
}

impl Default for SqlWriter {
    fn default() -> Self {
        Self::new(Arc::new(PostgresFlavor))
    }
}

impl SqlWriter {
    /// Creates a writer for a flavor.
    pub fn new(flavor: Arc<dyn SqlFlavor>) -> Self {
        Self {
            flavor,
            rewriter: None,
        }
    }

    /// Installs a column value rewriter.
    pub fn with_rewriter(mut self, rewriter: Arc<dyn ColumnValueRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    /// The active flavor.
    pub fn flavor(&self) -> &dyn SqlFlavor {
        self.flavor.as_ref()
    }

    fn bind(&self, table: &TableDef, column: &str, value: &Value) -> Value {
        match &self.rewriter {
            Some(r) => r.rewrite(&table.name, column, value.clone()),
            None => value.clone(),
        }
    }

    /// Columns to write, in declaration order: declared, present, not computed,
    /// not the primary key.
    fn written<'a>(&self, table: &'a TableDef, row: &DiffRow) -> Vec<(&'a str, Value)> {
        table
            .columns
            .iter()
            .filter(|c| !c.computed && table.primary_key.as_deref() != Some(c.name.as_str()))
            .filter_map(|c| row.columns.get(&c.name).map(|v| (c.name.as_str(), self.bind(table, &c.name, v))))
            .collect()
    }

    fn key_column(table: &TableDef) -> CoreResult<&str> {
        table
            .primary_key
            .as_deref()
            .ok_or_else(|| CoreError::invalid_schema(format!("{} has no primary key", table.name)))
    }

    /// Builds an INSERT for a new row. The primary key is generated by the engine.
    pub fn insert(&self, table: &TableDef, row: &DiffRow) -> CoreResult<SqlCommand> {
        let key_column = Self::key_column(table)?;
        let (columns, params): (Vec<String>, Vec<Value>) = self
            .written(table, row)
            .into_iter()
            .map(|(c, v)| (c.to_string(), v))
            .unzip();
        Ok(SqlCommand {
            kind: CommandKind::Insert,
            table: table.sql_table.clone(),
            text: self.flavor.insert_text(&table.sql_table, &columns, key_column),
            columns,
            params,
            key_column: key_column.to_string(),
            key_value: None,
        })
    }

    /// Builds an UPDATE of the changed columns; `None` if nothing is writable.
    pub fn update(&self, table: &TableDef, key: &Value, row: &DiffRow) -> CoreResult<Option<SqlCommand>> {
        let key_column = Self::key_column(table)?;
        let (columns, mut params): (Vec<String>, Vec<Value>) = self
            .written(table, row)
            .into_iter()
            .map(|(c, v)| (c.to_string(), v))
            .unzip();
        if columns.is_empty() {
            return Ok(None);
        }
        let f = self.flavor.as_ref();
        let assignments = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", f.quote(c), f.placeholder(i + 1)))
            .collect::<Vec<_>>()
            .join(", ");
        let text = format!(
            "UPDATE {} SET {assignments} WHERE {} = {}",
            f.quote(&table.sql_table),
            f.quote(key_column),
            f.placeholder(columns.len() + 1)
        );
        params.push(key.clone());
        Ok(Some(SqlCommand {
            kind: CommandKind::Update,
            table: table.sql_table.clone(),
            text,
            columns,
            params,
            key_column: key_column.to_string(),
            key_value: Some(key.clone()),
        }))
    }

    /// Builds a DELETE by primary key.
    pub fn delete(&self, table: &TableDef, key: &Value) -> CoreResult<SqlCommand> {
        let key_column = Self::key_column(table)?;
        let f = self.flavor.as_ref();
        Ok(SqlCommand {
            kind: CommandKind::Delete,
            table: table.sql_table.clone(),
            text: format!(
                "DELETE FROM {} WHERE {} = {}",
                f.quote(&table.sql_table),
                f.quote(key_column),
                f.placeholder(1)
            ),
            columns: Vec::new(),
            params: vec![key.clone()],
            key_column: key_column.to_string(),
            key_value: Some(key.clone()),
        })
    }

    /// Orders the writes needed to persist `diff`.
    ///
    /// `stored` is the current content of the daton; it locates the
    /// descendants of deleted rows. Steps come out as updates, then inserts
    /// (parents before children), then deletes (children before parents).
    pub fn plan(&self, def: &DatonDef, diff: &PersistonDiff, stored: &Daton) -> CoreResult<Vec<WriteStep>> {
        let mut plan = Plan::default();
        let table = &def.main_table;
        if def.is_single_row() {
            let main_key = def.main_key_value(&diff.key)?;
            for change in &diff.main.changed {
                let key = change
                    .primary_key
                    .clone()
                    .or_else(|| main_key.clone())
                    .ok_or_else(|| CoreError::diff_mismatch("main row has no key"))?;
                self.plan_changed(table, &key, change, stored.main_row(), &mut plan)?;
            }
            for new_row in &diff.main.new {
                self.plan_new(table, new_row, ParentBinding::None, true, &mut plan)?;
            }
            self.plan_deleted(table, &diff.main.deleted, &stored.rows, &mut plan)?;
        } else {
            self.plan_table(table, &diff.main, ParentBinding::None, &stored.rows, &mut plan)?;
        }
        Ok(plan.finish())
    }

    fn plan_table(
        &self,
        table: &TableDef,
        diff: &TableDiff,
        parent: ParentBinding,
        stored: &[Row],
        plan: &mut Plan,
    ) -> CoreResult<()> {
        for change in &diff.changed {
            let key = change.primary_key.clone().ok_or_else(|| {
                CoreError::diff_mismatch(format!("changed {} row has no key", table.name))
            })?;
            let stored_row = stored.iter().find(|r| table.primary_key_of(r) == Some(&key));
            self.plan_changed(table, &key, change, stored_row, plan)?;
        }
        for new_row in &diff.new {
            self.plan_new(table, new_row, parent.clone(), false, plan)?;
        }
        self.plan_deleted(table, &diff.deleted, stored, plan)
    }

    fn plan_changed(
        &self,
        table: &TableDef,
        key: &Value,
        change: &DiffRow,
        stored_row: Option<&Row>,
        plan: &mut Plan,
    ) -> CoreResult<()> {
        if let Some(command) = self.update(table, key, change)? {
            plan.updates.push(step(table, command));
        }
        for child in &table.children {
            if let Some(child_diff) = change.children.get(&child.name) {
                let stored_children = stored_row.map(|r| r.child_rows(&child.name)).unwrap_or(&[]);
                self.plan_table(child, child_diff, ParentBinding::Known(key.clone()), stored_children, plan)?;
            }
        }
        Ok(())
    }

    fn plan_new(
        &self,
        table: &TableDef,
        row: &DiffRow,
        parent: ParentBinding,
        is_main: bool,
        plan: &mut Plan,
    ) -> CoreResult<()> {
        let mut command = self.insert(table, row)?;
        let mut parent_insert = None;
        if let Some(parent_key) = &table.parent_key {
            let slot = match command.columns.iter().position(|c| c == parent_key) {
                Some(i) => i,
                None => {
                    command.columns.push(parent_key.clone());
                    command.params.push(Value::Null);
                    command.text = self
                        .flavor
                        .insert_text(&table.sql_table, &command.columns, &command.key_column);
                    command.columns.len() - 1
                }
            };
            match parent {
                ParentBinding::Known(value) => command.params[slot] = value,
                ParentBinding::Insert(step) => parent_insert = Some((step, slot)),
                ParentBinding::None => {}
            }
        }
        let index = plan.inserts.len();
        plan.inserts.push(WriteStep {
            table_name: table.name.clone(),
            command,
            parent_insert,
            is_main_insert: is_main,
        });
        for child in &table.children {
            if let Some(child_diff) = row.children.get(&child.name) {
                for child_row in &child_diff.new {
                    self.plan_new(child, child_row, ParentBinding::Insert(index), false, plan)?;
                }
            }
        }
        Ok(())
    }

    fn plan_deleted(&self, table: &TableDef, keys: &[Value], stored: &[Row], plan: &mut Plan) -> CoreResult<()> {
        for key in keys {
            if let Some(row) = stored.iter().find(|r| table.primary_key_of(r) == Some(key)) {
                self.plan_descendant_deletes(table, row, plan)?;
            }
            plan.deletes.push(step(table, self.delete(table, key)?));
        }
        Ok(())
    }

    fn plan_descendant_deletes(&self, table: &TableDef, row: &Row, plan: &mut Plan) -> CoreResult<()> {
        for child in &table.children {
            for child_row in row.child_rows(&child.name) {
                self.plan_descendant_deletes(child, child_row, plan)?;
                if let Some(key) = child.primary_key_of(child_row) {
                    plan.deletes.push(step(child, self.delete(child, key)?));
                }
            }
        }
        Ok(())
    }
}

fn step(table: &TableDef, command: SqlCommand) -> WriteStep {
    WriteStep {
        table_name: table.name.clone(),
        command,
        parent_insert: None,
        is_main_insert: false,
    }
}

#[derive(Default)]
struct Plan {
    updates: Vec<WriteStep>,
    inserts: Vec<WriteStep>,
    deletes: Vec<WriteStep>,
}

impl Plan {
    fn finish(self) -> Vec<WriteStep> {
        let offset = self.updates.len();
        let mut steps = self.updates;
        steps.extend(self.inserts.into_iter().map(|mut s| {
            if let Some((parent, slot)) = s.parent_insert {
                s.parent_insert = Some((parent + offset, slot));
            }
            s
        }));
        steps.extend(self.deletes);
        steps
    }
}
