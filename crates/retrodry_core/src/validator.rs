//! Declarative column checks plus an optional async custom validator.

use crate::daton::{Daton, Row};
use crate::schema::{ColDef, DatonDef, TableDef};
use crate::value::Value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FieldError {
    /// Table the failing value belongs to.
    pub table: String,
    /// Column, or `None` for row- or daton-level errors.
    pub column: Option<String>,
    /// Human-readable message in the requested language.
    pub message: String,
}

impl FieldError {
    /// Creates a column-level error.
    pub fn column(table: impl Into<String>, column: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: Some(column.into()),
            message: message.into(),
        }
    }

    /// Creates a daton-level error.
    pub fn daton(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(column) => write!(f, "{}.{}: {}", self.table, column, self.message),
            None => write!(f, "{}: {}", self.table, self.message),
        }
    }
}

/// Daton-level validation supplied by the schema owner.
#[async_trait]
pub trait CustomValidator: Send + Sync {
    /// Returns the errors found; an empty list means valid.
    async fn validate(&self, daton: &Daton, language: &str) -> Vec<FieldError>;
}

/// Shareable handle to a [`CustomValidator`] stored on a `DatonDef`.
#[derive(Clone)]
pub struct ValidatorHook(Arc<dyn CustomValidator>);

impl ValidatorHook {
    /// Wraps a validator.
    pub fn new(validator: impl CustomValidator + 'static) -> Self {
        Self(Arc::new(validator))
    }

    /// Runs the wrapped validator.
    pub async fn validate(&self, daton: &Daton, language: &str) -> Vec<FieldError> {
        self.0.validate(daton, language).await
    }
}

impl fmt::Debug for ValidatorHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValidatorHook")
    }
}

/// Runs the declarative column checks, in column order, recursing into child rows.
pub fn validate_columns(def: &DatonDef, daton: &Daton, language: &str) -> Vec<FieldError> {
    let mut errors = Vec::new();
    for row in &daton.rows {
        check_row(&def.main_table, row, language, &mut errors);
    }
    errors
}

/// Runs the column checks, then the custom validator if one is registered.
///
/// Errors accumulate; the daton is never modified.
pub async fn validate(def: &DatonDef, daton: &Daton, language: &str) -> Vec<FieldError> {
    let mut errors = validate_columns(def, daton, language);
    if let Some(hook) = &def.validator {
        errors.extend(hook.validate(daton, language).await);
    }
    errors
}

fn check_row(table: &TableDef, row: &Row, language: &str, errors: &mut Vec<FieldError>) {
    for col in &table.columns {
        if let Some(message) = check_value(table, col, row.value(&col.name), language) {
            errors.push(FieldError::column(&table.name, &col.name, message));
        }
    }
    for child in &table.children {
        for child_row in row.child_rows(&child.name) {
            check_row(child, child_row, language, errors);
        }
    }
}

fn check_value(table: &TableDef, col: &ColDef, value: &Value, language: &str) -> Option<String> {
    let prompt = col.prompt.resolve_or(language, &col.name);
    if value.is_null() {
        // Keys are assigned by the database or the parent row on insert.
        let assigned = col.computed
            || table.primary_key.as_deref() == Some(col.name.as_str())
            || table.parent_key.as_deref() == Some(col.name.as_str());
        return (!col.nullable && !assigned).then(|| format!("{prompt} is required"));
    }
    if !value.conforms_to(col.wire_type) {
        return Some(format!("{prompt} must be a {}", col.wire_type));
    }
    if let Some(text) = value.as_str() {
        let len = text.chars().count();
        if let Some(min) = col.min_length.filter(|min| len < *min) {
            return Some(format!("{prompt} must be at least {min} characters"));
        }
        if let Some(max) = col.max_length.filter(|max| len > *max) {
            return Some(format!("{prompt} must be at most {max} characters"));
        }
        if let Some(regex) = col.pattern_regex() {
            if !regex.is_match(text) {
                return Some(format!("{prompt} is not in the expected format"));
            }
        }
    }
    if let Some(number) = value.as_decimal() {
        if let Some(min) = col.min_value.filter(|min| number < *min) {
            return Some(format!("{prompt} must be at least {min}"));
        }
        if let Some(max) = col.max_value.filter(|max| number > *max) {
            return Some(format!("{prompt} must be at most {max}"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::DatonKey;
    use crate::value::{Decimal, WireType};

    struct NoAcme;

    #[async_trait]
    impl CustomValidator for NoAcme {
        async fn validate(&self, daton: &Daton, _language: &str) -> Vec<FieldError> {
            let company = daton.main_row().and_then(|r| r.value("Company").as_str());
            if company == Some("Acme") {
                vec![FieldError::daton("Customer", "Acme is banned")]
            } else {
                Vec::new()
            }
        }
    }

    fn def() -> DatonDef {
        DatonDef::persiston(
            "Customer",
            TableDef::new("Customer")
                .primary_key("CustomerId")
                .column(ColDef::new("CustomerId", WireType::Int32))
                .column(
                    ColDef::new("Company", WireType::Text)
                        .max_length(5)
                        .prompt("en", "Company")
                        .prompt("de", "Firma"),
                )
                .column(ColDef::new("Code", WireType::Text).nullable().pattern("^[A-Z]+$"))
                .column(
                    ColDef::new("Discount", WireType::Decimal)
                        .nullable()
                        .range(Decimal::ZERO, Decimal::from_i64(50)),
                )
                .child(
                    TableDef::new("CustomerNote")
                        .primary_key("NoteId")
                        .parent_key("CustomerId")
                        .column(ColDef::new("NoteId", WireType::Int32))
                        .column(ColDef::new("CustomerId", WireType::Int32))
                        .column(ColDef::new("Note", WireType::Text).min_length(1)),
                ),
        )
        .validator(ValidatorHook::new(NoAcme))
        .build()
        .unwrap()
    }

    #[tokio::test]
    async fn accumulates_errors_in_column_order() {
        let def = def();
        let daton = Daton::new(
            DatonKey::row("Customer", 1),
            vec![Row::new()
                .with("CustomerId", 1)
                .with("Company", "Too long name")
                .with("Code", "abc")
                .with("Discount", Decimal::from_i64(60))
                .with_child("CustomerNote", Row::new().with("Note", ""))],
        );
        let before = daton.clone();
        let errors = validate(&def, &daton, "de").await;
        let columns: Vec<_> = errors.iter().map(|e| e.column.as_deref().unwrap()).collect();
        assert_eq!(columns, ["Company", "Code", "Discount", "Note"]);
        assert_eq!(errors[0].message, "Firma must be at most 5 characters");
        assert_eq!(daton, before);
    }

    #[tokio::test]
    async fn missing_required_value_and_custom_rule() {
        let def = def();
        let daton = Daton::new(DatonKey::row("Customer", -1), vec![Row::new().with("Company", "Acme")]);
        let errors = validate(&def, &daton, "en").await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Acme is banned");

        let empty = Daton::new(DatonKey::row("Customer", 2), vec![Row::new().with("CustomerId", 2)]);
        let errors = validate(&def, &empty, "fr").await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Company is required");
    }
}
