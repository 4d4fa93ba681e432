//! Benchmark utilities.

use retrodry_core::{Daton, DatonKey, Row, Value};

/// Builds a loaded `Customer|=1` daton with `notes` child rows.
pub fn customer_with_notes(notes: usize) -> Daton {
    let mut main = Row::new()
        .with("CustomerId", 1)
        .with("Company", "Acme")
        .with("CreditLimit", Value::Null);
    main.child_rows_mut("CustomerNote");
    for i in 0..notes {
        main = main.with_child(
            "CustomerNote",
            Row::new()
                .with("NoteId", i as i64 + 1)
                .with("CustomerId", 1)
                .with("Note", format!("note number {i}").as_str()),
        );
    }
    Daton::new(DatonKey::row("Customer", 1), vec![main]).with_version("v1")
}

/// Edits every tenth note, drops the last one and appends a new one.
pub fn edit_customer(daton: &mut Daton) {
    let Some(row) = daton.main_row_mut() else {
        return;
    };
    row.set("Company", "Acme Ltd");
    let notes = row.child_rows_mut("CustomerNote");
    for note in notes.iter_mut().step_by(10) {
        note.set("Note", "rewritten");
    }
    notes.pop();
    notes.push(Row::new().with("CustomerId", 1).with("Note", "appended"));
}

/// Sizes used by the scaling benchmarks.
pub const NOTE_COUNTS: [usize; 4] = [0, 10, 100, 1000];
