//! Sample schema, seeded data and users.
//!
//! The sample dictionary covers every daton kind: a `Customer` persiston
//! with a `CustomerNote` child table and a manager-only `CreditLimit`, a
//! flat `Widget` persiston, the `PhoneType` whole-table persiston and the
//! `CustomerList` viewon.

use retrodry_core::{
    ColDef, DataDictionary, DatonDef, Decimal, PermissionLevel, TableDef, Value, WireDataDictionary,
    WireType,
};
use retrodry_server::{StaticAuthenticator, User};
use retrodry_storage::InMemoryDatabase;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Credential of a user without roles.
pub const CLERK: &str = "clerk-token";
/// Credential of a user with the `manager` role.
pub const MANAGER: &str = "manager-token";

/// The `Customer` persiston.
pub fn customer_def() -> DatonDef {
    DatonDef::persiston(
        "Customer",
        TableDef::new("Customer")
            .sql_table("Customers")
            .primary_key("CustomerId")
            .prompt("en", "Customer")
            .column(ColDef::new("CustomerId", WireType::Int32))
            .column(
                ColDef::new("Company", WireType::Text)
                    .max_length(40)
                    .main_column()
                    .sortable()
                    .prompt("en", "Company name"),
            )
            .column(
                ColDef::new("CreditLimit", WireType::Decimal)
                    .nullable()
                    .range(Decimal::new(0, 0), Decimal::new(1_000_000, 0))
                    .default_permission(PermissionLevel::View)
                    .permission("manager", PermissionLevel::Modify),
            )
            .child(
                TableDef::new("CustomerNote")
                    .sql_table("CustomerNotes")
                    .primary_key("NoteId")
                    .parent_key("CustomerId")
                    .column(ColDef::new("NoteId", WireType::Int32))
                    .column(ColDef::new("CustomerId", WireType::Int32))
                    .column(ColDef::new("Note", WireType::Text).max_length(200)),
            ),
    )
    .build()
    .expect("customer schema is valid")
}

/// The `Widget` persiston.
pub fn widget_def() -> DatonDef {
    DatonDef::persiston(
        "Widget",
        TableDef::new("Widget")
            .primary_key("WidgetId")
            .column(ColDef::new("WidgetId", WireType::Int32))
            .column(ColDef::new("ItemCode", WireType::Text).max_length(10).pattern("^[A-Z0-9-]+$"))
            .column(ColDef::new("Notes", WireType::Text).nullable()),
    )
    .build()
    .expect("widget schema is valid")
}

/// The `PhoneType` whole-table persiston.
pub fn phone_type_def() -> DatonDef {
    DatonDef::whole_table(
        "PhoneType",
        TableDef::new("PhoneTypeRow")
            .sql_table("PhoneTypes")
            .primary_key("PhoneTypeId")
            .column(ColDef::new("PhoneTypeId", WireType::Int32))
            .column(ColDef::new("TypeOfPhone", WireType::Text).max_length(20)),
    )
    .build()
    .expect("phone type schema is valid")
}

/// The `CustomerList` viewon, searchable by company.
pub fn customer_list_def() -> DatonDef {
    DatonDef::viewon(
        "CustomerList",
        TableDef::new("CustomerListRow")
            .sql_table("Customers")
            .primary_key("CustomerId")
            .column(ColDef::new("CustomerId", WireType::Int32))
            .column(ColDef::new("Company", WireType::Text).sortable()),
    )
    .criteria(TableDef::new("Criteria").column(ColDef::new("Company", WireType::Text)))
    .page_size(50)
    .build()
    .expect("customer list schema is valid")
}

/// Every sample definition.
pub fn sample_dictionary() -> DataDictionary {
    DataDictionary::new()
        .with(customer_def())
        .with(widget_def())
        .with(phone_type_def())
        .with(customer_list_def())
}

/// A database holding two customers, one note, one widget and two phone types.
///
/// Customer 1 is "Acme" with a credit limit of 100; widget 1 is "HEXNUT".
pub fn seeded_database() -> InMemoryDatabase {
    let db = InMemoryDatabase::new();
    db.seed(
        "Customers",
        "CustomerId",
        [("Company", Value::from("Acme")), ("CreditLimit", Value::Int(100))],
    );
    db.seed(
        "Customers",
        "CustomerId",
        [("Company", Value::from("Zeta")), ("CreditLimit", Value::Null)],
    );
    db.seed(
        "CustomerNotes",
        "NoteId",
        [("CustomerId", Value::Int(1)), ("Note", Value::from("Pays on time"))],
    );
    db.seed(
        "Widget",
        "WidgetId",
        [("ItemCode", Value::from("HEXNUT")), ("Notes", Value::from("Has 6 sides"))],
    );
    for phone in ["Mobile", "Office"] {
        db.seed("PhoneTypes", "PhoneTypeId", [("TypeOfPhone", Value::from(phone))]);
    }
    db
}

/// Authenticator knowing [`CLERK`] and [`MANAGER`].
pub fn sample_authenticator() -> StaticAuthenticator {
    StaticAuthenticator::new()
        .with_user(CLERK, User::new("clara"))
        .with_user(MANAGER, User::new("maya").with_role("manager"))
}

/// A wire data dictionary written to a temporary JSON file.
pub struct DictionaryFile {
    path: PathBuf,
    _temp_dir: TempDir,
}

impl DictionaryFile {
    /// Exports `dictionary` as `roles` would see it and writes it out.
    pub fn write(dictionary: &DataDictionary, roles: &[String]) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("dictionary.json");
        let wire = WireDataDictionary::export(dictionary, roles, "en");
        let json = serde_json::to_vec_pretty(&wire).expect("Failed to encode dictionary");
        std::fs::write(&path, json).expect("Failed to write dictionary file");
        Self {
            path,
            _temp_dir: temp_dir,
        }
    }

    /// The sample dictionary, unrestricted.
    pub fn sample() -> Self {
        Self::write(&sample_dictionary(), &["manager".to_string()])
    }

    /// Path of the JSON file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
