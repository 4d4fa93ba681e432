//! Wire form of the data dictionary.
//!
//! The server exports the definitions visible to a user, with prompts
//! resolved to the user's language and permissions resolved to a level.
//! Clients rebuild a usable [`DataDictionary`] from it.

use crate::error::{CoreError, CoreResult};
use crate::schema::{ColDef, DataDictionary, DatonDef, DatonKind, PermissionLevel, Permissions, TableDef, DEFAULT_LANGUAGE};
use crate::value::{Decimal, WireType};
use serde::{Deserialize, Serialize};

/// Exported dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireDataDictionary {
    /// Daton definitions in name order.
    pub datons: Vec<WireDatonDef>,
}

/// Exported daton definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireDatonDef {
    /// Type name.
    pub name: String,
    /// Kind.
    pub kind: DatonKind,
    /// Prompt in the requested language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Main table.
    pub main_table: WireTableDef,
    /// Viewon criteria.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<WireTableDef>,
    /// Viewon page size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
}

/// Exported table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireTableDef {
    /// Table name.
    pub name: String,
    /// Primary key column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    /// Parent key column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
    /// Prompt in the requested language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Effective level for the user.
    pub level: PermissionLevel,
    /// Columns in declaration order.
    pub columns: Vec<WireColDef>,
    /// Child tables.
    #[serde(default)]
    pub children: Vec<WireTableDef>,
}

/// Exported column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireColDef {
    /// Column name.
    pub name: String,
    /// Wire type.
    pub wire_type: WireType,
    /// Nullable.
    #[serde(default)]
    pub nullable: bool,
    /// Minimum length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    /// Maximum length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Minimum value, decimal text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<String>,
    /// Maximum value, decimal text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<String>,
    /// Regex source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Server-computed.
    #[serde(default)]
    pub computed: bool,
    /// Main display column.
    #[serde(default)]
    pub main_column: bool,
    /// Sortable.
    #[serde(default)]
    pub sort_column: bool,
    /// Prompt in the requested language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Effective level for the user.
    pub level: PermissionLevel,
}

impl WireDataDictionary {
    /// Exports what a user with `roles` may see, prompts in `language`.
    pub fn export(dictionary: &DataDictionary, roles: &[String], language: &str) -> Self {
        let visible = dictionary.restricted_for(roles);
        Self {
            datons: visible
                .iter()
                .map(|def| WireDatonDef {
                    name: def.name.clone(),
                    kind: def.kind,
                    prompt: def.prompt.resolve(language).map(str::to_string),
                    main_table: export_table(&def.main_table, language),
                    criteria: def.criteria.as_ref().map(|c| export_table(c, language)),
                    page_size: def.page_size,
                })
                .collect(),
        }
    }
}

fn export_table(table: &TableDef, language: &str) -> WireTableDef {
    WireTableDef {
        name: table.name.clone(),
        primary_key: table.primary_key.clone(),
        parent_key: table.parent_key.clone(),
        prompt: table.prompt.resolve(language).map(str::to_string),
        level: table.level(),
        columns: table
            .columns
            .iter()
            .map(|col| WireColDef {
                name: col.name.clone(),
                wire_type: col.wire_type,
                nullable: col.nullable,
                min_length: col.min_length,
                max_length: col.max_length,
                min_value: col.min_value.map(|d| d.to_string()),
                max_value: col.max_value.map(|d| d.to_string()),
                pattern: col.pattern.clone(),
                computed: col.computed,
                main_column: col.main_column,
                sort_column: col.sort_column,
                prompt: col.prompt.resolve(language).map(str::to_string),
                level: col.level(),
            })
            .collect(),
        children: table
            .children
            .iter()
            .map(|c| export_table(c, language))
            .collect(),
    }
}

impl DataDictionary {
    /// Rebuilds a dictionary from its wire form.
    ///
    /// Prompts are stored under the default language; levels become uniform
    /// permissions.
    pub fn from_wire(wire: &WireDataDictionary) -> CoreResult<DataDictionary> {
        let mut dictionary = DataDictionary::new();
        for daton in &wire.datons {
            let main_table = import_table(&daton.main_table)?;
            let mut builder = match daton.kind {
                DatonKind::SingleRowPersiston => DatonDef::persiston(&daton.name, main_table),
                DatonKind::WholeTablePersiston => DatonDef::whole_table(&daton.name, main_table),
                DatonKind::Viewon => DatonDef::viewon(&daton.name, main_table),
            }
            .default_permission(daton.main_table.level);
            if let Some(prompt) = &daton.prompt {
                builder = builder.prompt(DEFAULT_LANGUAGE, prompt);
            }
            if let Some(criteria) = &daton.criteria {
                builder = builder.criteria(import_table(criteria)?);
            }
            if let Some(rows) = daton.page_size {
                builder = builder.page_size(rows);
            }
            dictionary.insert(builder.build()?);
        }
        Ok(dictionary)
    }
}

fn import_table(wire: &WireTableDef) -> CoreResult<TableDef> {
    let mut table = TableDef::new(&wire.name).default_permission(wire.level);
    table.primary_key = wire.primary_key.clone();
    table.parent_key = wire.parent_key.clone();
    if let Some(prompt) = &wire.prompt {
        table = table.prompt(DEFAULT_LANGUAGE, prompt);
    }
    for wc in &wire.columns {
        table = table.column(import_column(wc)?);
    }
    for child in &wire.children {
        table = table.child(import_table(child)?);
    }
    Ok(table)
}

fn import_column(wire: &WireColDef) -> CoreResult<ColDef> {
    let parse_bound = |text: &Option<String>| {
        text.as_deref()
            .map(|t| {
                t.parse::<Decimal>()
                    .map_err(|_| CoreError::invalid_wire(format!("bad bound {t:?} on {}", wire.name)))
            })
            .transpose()
    };
    let mut col = ColDef::new(&wire.name, wire.wire_type);
    col.nullable = wire.nullable;
    col.min_length = wire.min_length;
    col.max_length = wire.max_length;
    col.min_value = parse_bound(&wire.min_value)?;
    col.max_value = parse_bound(&wire.max_value)?;
    col.pattern = wire.pattern.clone();
    col.computed = wire.computed;
    col.main_column = wire.main_column;
    col.sort_column = wire.sort_column;
    col.permissions = Permissions::uniform(wire.level);
    if let Some(prompt) = &wire.prompt {
        col.prompt.set(DEFAULT_LANGUAGE, prompt);
    }
    Ok(col)
}
