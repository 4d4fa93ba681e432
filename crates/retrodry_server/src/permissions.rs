//! Permission-filtered views of datons.
//!
//! Column and table visibility comes from
//! [`DatonDef::restricted_for`]: a daton cloned through the restricted
//! definition simply has no cells for invisible columns. An optional
//! [`RowFilter`] can additionally hide whole rows.

use crate::auth::User;
use crate::error::{ServerError, ServerResult};
use retrodry_core::{DataDictionary, Daton, DatonDef, DatonKey, Row, TableDef};
use std::sync::Arc;

/// Hides individual rows from a user.
pub trait RowFilter: Send + Sync {
    /// Returns false to hide `row` of `table` (and its children) from `user`.
    fn is_visible(&self, user: &User, table: &TableDef, row: &Row) -> bool;
}

/// The definition of `key` as `user` may see it.
pub fn restricted_def(dictionary: &DataDictionary, key: &DatonKey, user: &User) -> ServerResult<DatonDef> {
    let def = dictionary.def_for(key)?;
    def.restricted_for(&user.roles)
        .ok_or_else(|| ServerError::PermissionDenied(format!("{} is not visible", def.name)))
}

/// Copies `daton` keeping only what `restricted` declares and `filter` allows.
pub fn filter_daton(restricted: &DatonDef, daton: &Daton, user: &User, filter: Option<&Arc<dyn RowFilter>>) -> Daton {
    let mut copy = daton.clone_for(restricted);
    if let Some(filter) = filter {
        filter_rows(&restricted.main_table, &mut copy.rows, user, filter.as_ref());
    }
    copy
}

fn filter_rows(table: &TableDef, rows: &mut Vec<Row>, user: &User, filter: &dyn RowFilter) {
    rows.retain(|row| filter.is_visible(user, table, row));
    for row in rows.iter_mut() {
        for child in &table.children {
            if let Some(child_rows) = row.children.get_mut(&child.name) {
                filter_rows(child, child_rows, user, filter);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrodry_core::{ColDef, PermissionLevel, WireType};

    fn customer() -> DatonDef {
        DatonDef::persiston(
            "Customer",
            TableDef::new("Customer")
                .primary_key("CustomerId")
                .column(ColDef::new("CustomerId", WireType::Int32))
                .column(ColDef::new("Company", WireType::Text))
                .column(
                    ColDef::new("CreditLimit", WireType::Decimal)
                        .nullable()
                        .default_permission(PermissionLevel::None)
                        .permission("manager", PermissionLevel::Modify),
                )
                .child(
                    TableDef::new("CustomerNote")
                        .primary_key("NoteId")
                        .parent_key("CustomerId")
                        .column(ColDef::new("NoteId", WireType::Int32))
                        .column(ColDef::new("CustomerId", WireType::Int32))
                        .column(ColDef::new("Note", WireType::Text)),
                ),
        )
        .build()
        .unwrap()
    }

    fn daton() -> Daton {
        Daton::new(
            DatonKey::row("Customer", 1),
            vec![Row::new()
                .with("CustomerId", 1)
                .with("Company", "Acme")
                .with("CreditLimit", 500)
                .with_child("CustomerNote", Row::new().with("NoteId", 1).with("Note", "public"))
                .with_child("CustomerNote", Row::new().with("NoteId", 2).with("Note", "secret"))],
        )
    }

    struct HideSecretNotes;

    impl RowFilter for HideSecretNotes {
        fn is_visible(&self, _user: &User, table: &TableDef, row: &Row) -> bool {
            table.name != "CustomerNote" || row.value("Note").as_str() != Some("secret")
        }
    }

    #[test]
    fn invisible_columns_have_no_cells() {
        let dictionary = DataDictionary::new().with(customer());
        let clerk = User::new("c").with_role("clerk");
        let def = restricted_def(&dictionary, &DatonKey::row("Customer", 1), &clerk).unwrap();
        let filtered = filter_daton(&def, &daton(), &clerk, None);
        let main = filtered.main_row().unwrap();
        assert!(main.get("CreditLimit").is_none());
        assert_eq!(main.value("Company").as_str(), Some("Acme"));

        let manager = User::new("m").with_role("manager");
        let def = restricted_def(&dictionary, &DatonKey::row("Customer", 1), &manager).unwrap();
        assert!(filter_daton(&def, &daton(), &manager, None).main_row().unwrap().get("CreditLimit").is_some());
    }

    #[test]
    fn row_filter_hides_rows() {
        let def = customer();
        let filter: Arc<dyn RowFilter> = Arc::new(HideSecretNotes);
        let user = User::new("u");
        let filtered = filter_daton(&def, &daton(), &user, Some(&filter));
        let notes = filtered.main_row().unwrap().child_rows("CustomerNote");
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].value("Note").as_str(), Some("public"));
    }

    #[test]
    fn unknown_types_are_not_found() {
        let dictionary = DataDictionary::new().with(customer());
        let err = restricted_def(&dictionary, &DatonKey::row("Nope", 1), &User::new("u")).unwrap_err();
        assert_eq!(err.code(), retrodry_protocol::ErrorCode::NotFound);
    }
}
