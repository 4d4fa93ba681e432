//! Property-based test generators using proptest.
//!
//! Strategies produce keys and sample-schema datons that satisfy the
//! schema's constraints, so saves built from them validate.

use proptest::prelude::*;
use retrodry_core::{Criterion, Daton, DatonKey, Row, Value};

/// Strategy for text that exercises key escaping.
pub fn key_text_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex(r"[a-zA-Z0-9 =|\\/_-]{0,12}").expect("Invalid regex")
}

/// Strategy for keys of every kind, with escape-heavy viewon criteria.
pub fn daton_key_strategy() -> impl Strategy<Value = DatonKey> {
    let type_name = prop::string::string_regex("[A-Z][A-Za-z]{0,10}").expect("Invalid regex").boxed();
    prop_oneof![
        (type_name.clone(), any::<i32>()).prop_map(|(name, pk)| DatonKey::row(name, pk)),
        type_name.clone().prop_map(DatonKey::whole_table),
        (
            type_name,
            prop::collection::vec(
                (
                    prop::string::string_regex("[a-z][a-zA-Z0-9]{0,6}").expect("Invalid regex"),
                    key_text_strategy(),
                ),
                0..4
            ),
        )
            .prop_map(|(name, criteria)| {
                DatonKey::viewon(name, criteria.into_iter().map(|(k, v)| Criterion::new(k, v)))
            }),
    ]
}

/// Strategy for company names within the `Customer` schema.
pub fn company_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{0,15}( [A-Z][a-z]{0,10})?").expect("Invalid regex")
}

/// Strategy for note text.
pub fn note_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z ]{1,40}").expect("Invalid regex")
}

/// Strategy for a stored `Customer|=1` daton with up to five notes.
pub fn customer_strategy() -> impl Strategy<Value = Daton> {
    (company_strategy(), prop::collection::vec(note_strategy(), 0..5)).prop_map(|(company, notes)| {
        let mut main = Row::new()
            .with("CustomerId", 1)
            .with("Company", company.as_str())
            .with("CreditLimit", Value::Null);
        // Loaded rows always carry their child sections, even empty ones.
        main.child_rows_mut("CustomerNote");
        for (i, text) in notes.iter().enumerate() {
            main = main.with_child(
                "CustomerNote",
                Row::new()
                    .with("NoteId", i as i64 + 1)
                    .with("CustomerId", 1)
                    .with("Note", text.as_str()),
            );
        }
        Daton::new(DatonKey::row("Customer", 1), vec![main]).with_version("v1")
    })
}

/// One change a user makes to a customer.
#[derive(Debug, Clone)]
pub enum CustomerEdit {
    /// Rename the company.
    Rename(String),
    /// Rewrite the note at this position (modulo the note count).
    EditNote(usize, String),
    /// Remove the note at this position (modulo the note count).
    DeleteNote(usize),
    /// Append a note without a key.
    AddNote(String),
}

impl CustomerEdit {
    /// Applies the edit to a customer daton in place.
    pub fn apply_to(&self, daton: &mut Daton) {
        let Some(row) = daton.main_row_mut() else {
            return;
        };
        match self {
            CustomerEdit::Rename(company) => row.set("Company", company.as_str()),
            CustomerEdit::EditNote(at, text) => {
                let notes = row.child_rows_mut("CustomerNote");
                if !notes.is_empty() {
                    let index = at % notes.len();
                    notes[index].set("Note", text.as_str());
                }
            }
            CustomerEdit::DeleteNote(at) => {
                let notes = row.child_rows_mut("CustomerNote");
                if !notes.is_empty() {
                    let index = at % notes.len();
                    notes.remove(index);
                }
            }
            CustomerEdit::AddNote(text) => row
                .child_rows_mut("CustomerNote")
                .push(Row::new().with("CustomerId", 1).with("Note", text.as_str())),
        }
    }
}

/// Strategy for customer edits.
pub fn customer_edit_strategy() -> impl Strategy<Value = CustomerEdit> {
    prop_oneof![
        1 => company_strategy().prop_map(CustomerEdit::Rename),
        3 => (any::<usize>(), note_strategy()).prop_map(|(at, text)| CustomerEdit::EditNote(at, text)),
        1 => any::<usize>().prop_map(CustomerEdit::DeleteNote),
        2 => note_strategy().prop_map(CustomerEdit::AddNote),
    ]
}

/// Strategy for a customer and a modified copy of it.
pub fn customer_change_strategy() -> impl Strategy<Value = (Daton, Daton)> {
    (customer_strategy(), prop::collection::vec(customer_edit_strategy(), 0..6)).prop_map(
        |(pristine, edits)| {
            let mut modified = pristine.clone();
            for edit in &edits {
                edit.apply_to(&mut modified);
            }
            (pristine, modified)
        },
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::customer_def;
    use retrodry_core::diff::{apply, diff};
    use retrodry_core::clone_daton;
    use retrodry_core::validator::validate_columns;
    use retrodry_core::wire::diff_json::{diff_from_json, diff_to_json};

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn keys_survive_text_form(key in daton_key_strategy()) {
            let parsed: DatonKey = key.to_string().parse().unwrap();
            prop_assert_eq!(parsed, key);
        }

        #[test]
        fn generated_customers_validate(customer in customer_strategy()) {
            let def = customer_def();
            prop_assert!(validate_columns(&def, &customer, "en").is_empty());
            prop_assert_eq!(clone_daton(&def, &customer), customer);
        }

        #[test]
        fn wire_diffs_reproduce_the_edit((pristine, modified) in customer_change_strategy()) {
            let def = customer_def();
            let delta = diff(&def, &pristine, &modified).unwrap();
            let sent = diff_from_json(&def, &diff_to_json(&def, &delta), true).unwrap();
            let mut target = pristine.clone();
            apply(&def, &sent, &mut target).unwrap();
            prop_assert_eq!(target, modified);
        }
    }
}
