//! # RetroDRY Core
//!
//! Schema model, daton keys, wire codec and diff engine shared by the
//! RetroDRY server and client.
//!
//! A *daton* is a schema-described business object: either an editable
//! *persiston* (locked while edited) or a read-only *viewon* (a query result).
//! This crate knows how to:
//!
//! - describe datons with [`DatonDef`], [`TableDef`] and [`ColDef`] builders
//! - parse and format [`DatonKey`] strings
//! - encode and decode datons as verbose or dense JSON ([`wire`])
//! - clone, diff and apply changes ([`diff`])
//! - validate datons ([`validator`])
//! - turn a diff into SQL commands ([`sql`])
//!
//! ## Usage
//!
//! ```
//! use retrodry_core::{diff, ColDef, Daton, DatonDef, DatonKey, Row, TableDef, WireType};
//!
//! let def = DatonDef::persiston(
//!     "Widget",
//!     TableDef::new("Widget")
//!         .primary_key("WidgetId")
//!         .column(ColDef::new("WidgetId", WireType::Int32))
//!         .column(ColDef::new("Notes", WireType::Text).nullable()),
//! )
//! .build()
//! .unwrap();
//!
//! let pristine = Daton::new(
//!     DatonKey::row("Widget", 9),
//!     vec![Row::new().with("WidgetId", 9).with("Notes", "Has 6 sides")],
//! );
//! let mut modified = pristine.clone();
//! modified.main_row_mut().unwrap().set("Notes", "Has 7 sides");
//!
//! let delta = diff::diff(&def, &pristine, &modified).unwrap();
//! assert_eq!(delta.main.changed[0].columns.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod daton;
pub mod diff;
mod error;
pub mod key;
pub mod schema;
pub mod sql;
pub mod validator;
mod value;
pub mod wire;

pub use daton::{clone_daton, Daton, Row};
pub use diff::{apply, DiffRow, PersistonDiff, TableDiff};
pub use error::{CoreError, CoreResult};
pub use key::{Criterion, DatonKey};
pub use schema::{
    ColDef, DataDictionary, DatonDef, DatonDefBuilder, DatonKind, PermissionLevel, Permissions,
    Prompt, TableDef, DEFAULT_LANGUAGE,
};
pub use sql::{
    ColumnValueRewriter, CommandKind, PostgresFlavor, SqlCommand, SqlFlavor, SqlServerFlavor,
    SqlWriter, SqliteFlavor, WriteStep,
};
pub use validator::{CustomValidator, FieldError, ValidatorHook};
pub use value::{Decimal, Value, WireType};
pub use wire::dictionary::WireDataDictionary;
pub use wire::Encoding;
