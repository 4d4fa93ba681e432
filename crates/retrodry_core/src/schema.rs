//! Schema model: daton, table and column definitions.
//!
//! Schemas are built explicitly in code at startup:
//!
//! ```
//! use retrodry_core::{ColDef, DatonDef, TableDef, WireType};
//!
//! let def = DatonDef::persiston(
//!     "Widget",
//!     TableDef::new("Widget")
//!         .primary_key("WidgetId")
//!         .column(ColDef::new("WidgetId", WireType::Int32))
//!         .column(ColDef::new("ItemCode", WireType::Text).max_length(20))
//!         .column(ColDef::new("Notes", WireType::Text).nullable()),
//! )
//! .build()
//! .unwrap();
//! assert_eq!(def.main_table.columns.len(), 3);
//! ```

use crate::error::{CoreError, CoreResult};
use crate::key::DatonKey;
use crate::validator::ValidatorHook;
use crate::value::{Decimal, Value, WireType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Language used when a prompt has no entry for the requested language.
pub const DEFAULT_LANGUAGE: &str = "en";

/// How much a role may see and change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PermissionLevel {
    /// Invisible.
    None,
    /// Readable, not modifiable.
    View,
    /// Readable and modifiable.
    Modify,
}

/// Per-role permission overrides attached to a daton, table or column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions {
    /// Level for users holding none of the listed roles.
    pub default: Option<PermissionLevel>,
    /// Level per role name.
    pub roles: BTreeMap<String, PermissionLevel>,
}

impl Permissions {
    /// Permissions that grant the same level to everyone.
    pub fn uniform(level: PermissionLevel) -> Self {
        Self {
            default: Some(level),
            roles: BTreeMap::new(),
        }
    }

    /// Returns true if nothing is declared here.
    pub fn is_unset(&self) -> bool {
        self.default.is_none() && self.roles.is_empty()
    }

    /// Resolves the level for a user's roles.
    ///
    /// The most permissive matching role wins; the default applies when no
    /// role matches. `None` means "inherit from the enclosing definition".
    pub fn level_for(&self, roles: &[String]) -> Option<PermissionLevel> {
        roles
            .iter()
            .filter_map(|role| self.roles.get(role))
            .max()
            .copied()
            .or(self.default)
    }
}

/// A localized string: language code to text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Prompt(pub BTreeMap<String, String>);

impl Prompt {
    /// Adds or replaces the text for a language.
    pub fn set(&mut self, language: impl Into<String>, text: impl Into<String>) {
        self.0.insert(language.into(), text.into());
    }

    /// Resolves the prompt for `language`, falling back to [`DEFAULT_LANGUAGE`].
    pub fn resolve(&self, language: &str) -> Option<&str> {
        self.0
            .get(language)
            .or_else(|| self.0.get(DEFAULT_LANGUAGE))
            .map(String::as_str)
    }

    /// Resolves the prompt, falling back to `fallback` when nothing matches.
    pub fn resolve_or<'a>(&'a self, language: &str, fallback: &'a str) -> &'a str {
        self.resolve(language).unwrap_or(fallback)
    }
}

/// Definition of one column.
#[derive(Debug, Clone)]
pub struct ColDef {
    /// Column name (also the JSON member name).
    pub name: String,
    /// Wire type.
    pub wire_type: WireType,
    /// Whether null is allowed.
    pub nullable: bool,
    /// Minimum string length.
    pub min_length: Option<usize>,
    /// Maximum string length.
    pub max_length: Option<usize>,
    /// Minimum numeric value.
    pub min_value: Option<Decimal>,
    /// Maximum numeric value.
    pub max_value: Option<Decimal>,
    /// Regex the text value must match.
    pub pattern: Option<String>,
    /// Computed on the server; never written by the SQL layer.
    pub computed: bool,
    /// Shown as the main display column of its row.
    pub main_column: bool,
    /// May be used as a `_sort` column.
    pub sort_column: bool,
    /// Localized prompt.
    pub prompt: Prompt,
    /// Per-role permissions.
    pub permissions: Permissions,
    compiled_pattern: Option<Regex>,
}

impl ColDef {
    /// Creates a non-nullable column.
    pub fn new(name: impl Into<String>, wire_type: WireType) -> Self {
        Self {
            name: name.into(),
            wire_type,
            nullable: false,
            min_length: None,
            max_length: None,
            min_value: None,
            max_value: None,
            pattern: None,
            computed: false,
            main_column: false,
            sort_column: false,
            prompt: Prompt::default(),
            permissions: Permissions::default(),
            compiled_pattern: None,
        }
    }

    /// Allows null values.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Sets the minimum string length.
    pub fn min_length(mut self, len: usize) -> Self {
        self.min_length = Some(len);
        self
    }

    /// Sets the maximum string length.
    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    /// Sets the numeric range (inclusive).
    pub fn range(mut self, min: Decimal, max: Decimal) -> Self {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self
    }

    /// Sets the regex pattern for text values. Compiled by [`DatonDefBuilder::build`].
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Marks the column as server-computed.
    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    /// Marks the column as the main display column.
    pub fn main_column(mut self) -> Self {
        self.main_column = true;
        self
    }

    /// Allows sorting by this column.
    pub fn sortable(mut self) -> Self {
        self.sort_column = true;
        self
    }

    /// Adds a localized prompt.
    pub fn prompt(mut self, language: &str, text: &str) -> Self {
        self.prompt.set(language, text);
        self
    }

    /// Sets the level for a role.
    ///
    /// Primary and parent key columns never drop below
    /// [`PermissionLevel::View`] while their table is visible: a `None`
    /// given here is raised to `View` on restriction.
    pub fn permission(mut self, role: &str, level: PermissionLevel) -> Self {
        self.permissions.roles.insert(role.to_string(), level);
        self
    }

    /// Sets the level for users without a matching role.
    pub fn default_permission(mut self, level: PermissionLevel) -> Self {
        self.permissions.default = Some(level);
        self
    }

    /// Returns the compiled pattern, if one is declared.
    pub fn pattern_regex(&self) -> Option<&Regex> {
        self.compiled_pattern.as_ref()
    }

    fn compile(&mut self) -> CoreResult<()> {
        if let Some(pattern) = &self.pattern {
            let regex = Regex::new(pattern).map_err(|e| {
                CoreError::invalid_schema(format!("bad pattern on {}: {e}", self.name))
            })?;
            self.compiled_pattern = Some(regex);
        }
        Ok(())
    }
}

/// Definition of one table (main table or child table) of a daton.
#[derive(Debug, Clone)]
pub struct TableDef {
    /// Table name, used as the JSON member name.
    pub name: String,
    /// Backing SQL table; defaults to `name`.
    pub sql_table: String,
    /// Primary key column.
    pub primary_key: Option<String>,
    /// For child tables: the column holding the parent row's primary key.
    pub parent_key: Option<String>,
    /// Columns in declaration order (drives the dense encoding).
    pub columns: Vec<ColDef>,
    /// Child tables in declaration order.
    pub children: Vec<TableDef>,
    /// Localized prompt.
    pub prompt: Prompt,
    /// Per-role permissions.
    pub permissions: Permissions,
}

impl TableDef {
    /// Creates an empty table definition.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            sql_table: name.clone(),
            name,
            primary_key: None,
            parent_key: None,
            columns: Vec::new(),
            children: Vec::new(),
            prompt: Prompt::default(),
            permissions: Permissions::default(),
        }
    }

    /// Sets the backing SQL table.
    pub fn sql_table(mut self, table: impl Into<String>) -> Self {
        self.sql_table = table.into();
        self
    }

    /// Sets the primary key column.
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    /// Sets the parent key column.
    pub fn parent_key(mut self, column: impl Into<String>) -> Self {
        self.parent_key = Some(column.into());
        self
    }

    /// Appends a column.
    pub fn column(mut self, col: ColDef) -> Self {
        self.columns.push(col);
        self
    }

    /// Appends a child table.
    pub fn child(mut self, child: TableDef) -> Self {
        self.children.push(child);
        self
    }

    /// Adds a localized prompt.
    pub fn prompt(mut self, language: &str, text: &str) -> Self {
        self.prompt.set(language, text);
        self
    }

    /// Sets the level for a role.
    pub fn permission(mut self, role: &str, level: PermissionLevel) -> Self {
        self.permissions.roles.insert(role.to_string(), level);
        self
    }

    /// Sets the level for users without a matching role.
    pub fn default_permission(mut self, level: PermissionLevel) -> Self {
        self.permissions.default = Some(level);
        self
    }

    /// Flattens the columns of `base` into this table.
    ///
    /// Inherited columns come first, in the base's order; a column declared
    /// on this table replaces the inherited column of the same name.
    pub fn inherit(mut self, base: &TableDef) -> Self {
        let mut merged: Vec<ColDef> = base
            .columns
            .iter()
            .filter(|c| self.column_def(&c.name).is_none())
            .cloned()
            .collect();
        merged.append(&mut self.columns);
        self.columns = merged;
        if self.primary_key.is_none() {
            self.primary_key = base.primary_key.clone();
        }
        self
    }

    /// Looks up a column.
    pub fn column_def(&self, name: &str) -> Option<&ColDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Looks up a direct child table.
    pub fn child_def(&self, name: &str) -> Option<&TableDef> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Returns the primary key column definition.
    pub fn primary_key_def(&self) -> Option<&ColDef> {
        self.primary_key.as_deref().and_then(|pk| self.column_def(pk))
    }

    /// Reads the primary key value from a row.
    pub fn primary_key_of<'a>(&self, row: &'a crate::daton::Row) -> Option<&'a Value> {
        self.primary_key
            .as_deref()
            .and_then(|pk| row.get(pk))
            .filter(|v| !v.is_null())
    }

    /// Finds a table by name anywhere in this subtree.
    pub fn find(&self, name: &str) -> Option<&TableDef> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    fn validate(&self, is_main: bool, names: &mut HashSet<String>) -> CoreResult<()> {
        if !names.insert(self.name.clone()) {
            return Err(CoreError::invalid_schema(format!(
                "table name {} used twice",
                self.name
            )));
        }
        let mut cols = HashSet::new();
        for col in &self.columns {
            if !cols.insert(col.name.as_str()) {
                return Err(CoreError::invalid_schema(format!(
                    "column {}.{} declared twice",
                    self.name, col.name
                )));
            }
            if self.child_def(&col.name).is_some() {
                return Err(CoreError::invalid_schema(format!(
                    "column {}.{} collides with a child table",
                    self.name, col.name
                )));
            }
        }
        if let Some(pk) = &self.primary_key {
            if !cols.contains(pk.as_str()) {
                return Err(CoreError::invalid_schema(format!(
                    "primary key {pk} is not a column of {}",
                    self.name
                )));
            }
        }
        if !is_main {
            if self.primary_key.is_none() {
                return Err(CoreError::invalid_schema(format!(
                    "child table {} needs a primary key",
                    self.name
                )));
            }
            match &self.parent_key {
                Some(pk) if cols.contains(pk.as_str()) => {}
                _ => {
                    return Err(CoreError::invalid_schema(format!(
                        "child table {} needs a parent key column",
                        self.name
                    )))
                }
            }
        }
        for child in &self.children {
            child.validate(false, names)?;
        }
        Ok(())
    }

    fn compile(&mut self) -> CoreResult<()> {
        for col in &mut self.columns {
            col.compile()?;
        }
        for child in &mut self.children {
            child.compile()?;
        }
        Ok(())
    }

    /// Copy of this table keeping only what `roles` may see, with resolved levels.
    fn restricted(&self, roles: &[String], inherited: PermissionLevel, cap: PermissionLevel) -> Option<TableDef> {
        let level = self.permissions.level_for(roles).unwrap_or(inherited).min(cap);
        if level == PermissionLevel::None {
            return None;
        }
        let mut table = self.clone();
        table.permissions = Permissions::uniform(level);
        table.columns = self
            .columns
            .iter()
            .filter_map(|col| {
                let col_level = col.permissions.level_for(roles).unwrap_or(level).min(cap);
                let is_key = Some(&col.name) == self.primary_key.as_ref()
                    || Some(&col.name) == self.parent_key.as_ref();
                // Keys stay visible so rows remain addressable.
                let col_level = if is_key {
                    col_level.max(PermissionLevel::View)
                } else {
                    col_level
                };
                (col_level != PermissionLevel::None).then(|| {
                    let mut col = col.clone();
                    col.permissions = Permissions::uniform(col_level);
                    col
                })
            })
            .collect();
        table.children = self
            .children
            .iter()
            .filter_map(|c| c.restricted(roles, level, cap))
            .collect();
        Some(table)
    }

    /// Resolved level of this table (meaningful on restricted definitions).
    pub fn level(&self) -> PermissionLevel {
        self.permissions.default.unwrap_or(PermissionLevel::Modify)
    }
}

impl ColDef {
    /// Resolved level of this column (meaningful on restricted definitions).
    pub fn level(&self) -> PermissionLevel {
        self.permissions.default.unwrap_or(PermissionLevel::Modify)
    }
}

/// What kind of daton a definition describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatonKind {
    /// Editable, one main row, keyed by `=<pk>`.
    SingleRowPersiston,
    /// Editable, every row of the main table, keyed by `+`.
    WholeTablePersiston,
    /// Read-only query result keyed by criteria.
    Viewon,
}

impl DatonKind {
    /// Returns true for both persiston kinds.
    pub fn is_persiston(&self) -> bool {
        !matches!(self, DatonKind::Viewon)
    }
}

/// Definition of a daton type.
#[derive(Debug, Clone)]
pub struct DatonDef {
    /// Daton type name (the first key segment).
    pub name: String,
    /// Kind of daton.
    pub kind: DatonKind,
    /// Main table and its child tree.
    pub main_table: TableDef,
    /// Viewon criteria columns.
    pub criteria: Option<TableDef>,
    /// Viewon page size; `None` disables paging.
    pub page_size: Option<usize>,
    /// Localized prompt.
    pub prompt: Prompt,
    /// Per-role permissions.
    pub permissions: Permissions,
    /// Custom validation hook.
    pub validator: Option<ValidatorHook>,
}

impl DatonDef {
    /// Starts a single-row persiston definition.
    pub fn persiston(name: impl Into<String>, main_table: TableDef) -> DatonDefBuilder {
        DatonDefBuilder::new(name, DatonKind::SingleRowPersiston, main_table)
    }

    /// Starts a whole-table persiston definition.
    pub fn whole_table(name: impl Into<String>, main_table: TableDef) -> DatonDefBuilder {
        DatonDefBuilder::new(name, DatonKind::WholeTablePersiston, main_table)
    }

    /// Starts a viewon definition.
    pub fn viewon(name: impl Into<String>, main_table: TableDef) -> DatonDefBuilder {
        DatonDefBuilder::new(name, DatonKind::Viewon, main_table)
    }

    /// Returns true if the main table holds exactly one row.
    pub fn is_single_row(&self) -> bool {
        self.kind == DatonKind::SingleRowPersiston
    }

    /// Finds a table anywhere in the daton.
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.main_table.find(name)
    }

    /// Parses the primary key of a single-row persiston key as a typed value.
    pub fn main_key_value(&self, key: &DatonKey) -> CoreResult<Option<Value>> {
        let Some(text) = key.persiston_key_str() else {
            return Ok(None);
        };
        let wire_type = self
            .main_table
            .primary_key_def()
            .map(|c| c.wire_type)
            .unwrap_or(WireType::Int32);
        Value::from_key_text(text, wire_type).map(Some)
    }

    /// Returns a copy of this definition restricted to what `roles` may see.
    ///
    /// Invisible tables and columns are removed and every remaining element
    /// carries its resolved level. Key columns of a visible table are kept
    /// at `View` or above whatever their own level says. Returns `None` if
    /// the daton is invisible.
    pub fn restricted_for(&self, roles: &[String]) -> Option<DatonDef> {
        let daton_level = self
            .permissions
            .level_for(roles)
            .unwrap_or(PermissionLevel::Modify);
        let cap = if self.kind.is_persiston() {
            PermissionLevel::Modify
        } else {
            PermissionLevel::View
        };
        let main_table = self.main_table.restricted(roles, daton_level, cap)?;
        let mut def = self.clone();
        def.permissions = Permissions::uniform(main_table.level());
        def.main_table = main_table;
        Some(def)
    }
}

/// Builder for [`DatonDef`]; `build` validates and compiles the schema.
pub struct DatonDefBuilder {
    def: DatonDef,
}

impl DatonDefBuilder {
    fn new(name: impl Into<String>, kind: DatonKind, main_table: TableDef) -> Self {
        Self {
            def: DatonDef {
                name: name.into(),
                kind,
                main_table,
                criteria: None,
                page_size: None,
                prompt: Prompt::default(),
                permissions: Permissions::default(),
                validator: None,
            },
        }
    }

    /// Sets the viewon criteria columns.
    pub fn criteria(mut self, criteria: TableDef) -> Self {
        self.def.criteria = Some(criteria);
        self
    }

    /// Sets the viewon page size.
    pub fn page_size(mut self, rows: usize) -> Self {
        self.def.page_size = Some(rows);
        self
    }

    /// Adds a localized prompt.
    pub fn prompt(mut self, language: &str, text: &str) -> Self {
        self.def.prompt.set(language, text);
        self
    }

    /// Sets the level for a role.
    pub fn permission(mut self, role: &str, level: PermissionLevel) -> Self {
        self.def.permissions.roles.insert(role.to_string(), level);
        self
    }

    /// Sets the level for users without a matching role.
    pub fn default_permission(mut self, level: PermissionLevel) -> Self {
        self.def.permissions.default = Some(level);
        self
    }

    /// Registers a custom validator.
    pub fn validator(mut self, hook: ValidatorHook) -> Self {
        self.def.validator = Some(hook);
        self
    }

    /// Validates and finishes the definition.
    pub fn build(mut self) -> CoreResult<DatonDef> {
        let def = &mut self.def;
        if def.name.is_empty() {
            return Err(CoreError::invalid_schema("daton name is empty"));
        }
        if def.kind.is_persiston() && def.main_table.primary_key.is_none() {
            return Err(CoreError::invalid_schema(format!(
                "persiston {} needs a main table primary key",
                def.name
            )));
        }
        if def.kind.is_persiston() && def.criteria.is_some() {
            return Err(CoreError::invalid_schema(format!(
                "persiston {} cannot declare criteria",
                def.name
            )));
        }
        def.main_table.validate(true, &mut HashSet::new())?;
        def.main_table.compile()?;
        if let Some(criteria) = &mut def.criteria {
            criteria.compile()?;
        }
        Ok(self.def)
    }
}

/// All daton definitions known to a server or client.
#[derive(Debug, Clone, Default)]
pub struct DataDictionary {
    datons: BTreeMap<String, Arc<DatonDef>>,
}

impl DataDictionary {
    /// Creates an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition, replacing any previous one with that name.
    pub fn insert(&mut self, def: DatonDef) {
        self.datons.insert(def.name.clone(), Arc::new(def));
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, def: DatonDef) -> Self {
        self.insert(def);
        self
    }

    /// Looks up a definition by type name.
    pub fn get(&self, name: &str) -> CoreResult<&Arc<DatonDef>> {
        self.datons.get(name).ok_or_else(|| CoreError::UnknownDatonType {
            name: name.to_string(),
        })
    }

    /// Looks up the definition addressed by a key.
    pub fn def_for(&self, key: &DatonKey) -> CoreResult<&Arc<DatonDef>> {
        self.get(key.type_name())
    }

    /// Iterates definitions in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DatonDef>> {
        self.datons.values()
    }

    /// Number of definitions.
    pub fn len(&self) -> usize {
        self.datons.len()
    }

    /// Returns true if there are no definitions.
    pub fn is_empty(&self) -> bool {
        self.datons.is_empty()
    }

    /// Dictionary of definitions restricted to what `roles` may see.
    pub fn restricted_for(&self, roles: &[String]) -> DataDictionary {
        DataDictionary {
            datons: self
                .datons
                .iter()
                .filter_map(|(name, def)| {
                    def.restricted_for(roles)
                        .map(|d| (name.clone(), Arc::new(d)))
                })
                .collect(),
        }
    }
}
