//! Cluster integration tests: real client sessions against several coordinator nodes.

use retrodry_client::{GetOptions, SessionEvent};
use retrodry_core::{Criterion, Daton, DatonKey, Decimal, Row, Value};
use retrodry_protocol::{ErrorCode, SubscribeState};
use retrodry_storage::SqlDatabase;
use retrodry_testkit::prelude::*;
use std::time::{Duration, Instant};

fn acme() -> DatonKey {
    DatonKey::row("Customer", 1)
}

#[tokio::test]
async fn locks_are_exclusive_across_nodes() {
    init_tracing();
    let cluster = TestCluster::new(2);
    let first = cluster.connect(0, CLERK).await.unwrap();
    let second = cluster.connect(1, MANAGER).await.unwrap();

    first.get(&acme(), GetOptions::lock()).await.unwrap();
    let err = second.get(&acme(), GetOptions::lock()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::LockConflict);
    assert_eq!(second.subscribe_state(&acme()), SubscribeState::Subscribed);

    // A save from the other node is refused while the lock is held.
    let mut edited = second.cached(&acme()).unwrap();
    edited.main_row_mut().unwrap().set("Company", "Hijacked");
    let outcomes = second.save(&[edited]).await.unwrap();
    assert!(!outcomes[0].success);
    assert_eq!(outcomes[0].errors[0].code, ErrorCode::LockConflict);

    // Quitting releases every lock the session held.
    first.quit().await.unwrap();
    let errors = second
        .change_subscribe_state(&[acme()], SubscribeState::Locked)
        .await
        .unwrap();
    assert!(errors.is_empty());
    second.quit().await.unwrap();
}

#[tokio::test]
async fn saves_reach_watchers_on_other_nodes_promptly() {
    init_tracing();
    let cluster = TestCluster::new(3);
    let editor = cluster.connect(0, MANAGER).await.unwrap();
    let watcher = cluster.connect(2, CLERK).await.unwrap();
    let mut events = watcher.events();
    watcher.get(&acme(), GetOptions::default()).await.unwrap();
    watcher
        .change_subscribe_state(&[acme()], SubscribeState::Subscribed)
        .await
        .unwrap();
    // Let the watcher's long-poll reach its node.
    tokio::time::sleep(PROPAGATION_INTERVAL * 4).await;

    let mut customer = editor.get(&acme(), GetOptions::lock()).await.unwrap();
    customer.main_row_mut().unwrap().set("Company", "Acme Holdings");
    let saved_at = Instant::now();
    assert!(editor.save(&[customer]).await.unwrap()[0].success);

    let event = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::DatonUpdated(key)) => return key,
                Ok(_) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("no update within the propagation bound");
    assert_eq!(event, acme());
    assert!(saved_at.elapsed() < Duration::from_secs(1));

    let cached = watcher.cached(&acme()).unwrap();
    assert_eq!(cached.main_row().unwrap().value("Company").as_str(), Some("Acme Holdings"));
    editor.quit().await.unwrap();
    watcher.quit().await.unwrap();
}

#[tokio::test]
async fn restricted_columns_are_rejected_but_the_rest_saves() {
    init_tracing();
    let cluster = TestCluster::new(1);
    let clerk = cluster.connect(0, CLERK).await.unwrap();
    let manager = cluster.connect(0, MANAGER).await.unwrap();

    let mut customer = clerk.get(&acme(), GetOptions::lock()).await.unwrap();
    assert_eq!(customer.main_row().unwrap().value("CreditLimit"), &Value::Decimal(Decimal::from_i64(100)));
    let row = customer.main_row_mut().unwrap();
    row.set("Company", "Acme Ltd");
    row.set("CreditLimit", Decimal::new(5000, 0));
    let outcome = &clerk.save(&[customer]).await.unwrap()[0];
    assert!(outcome.success);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].code, ErrorCode::PermissionDenied);
    assert_eq!(outcome.errors[0].field_errors[0].column.as_deref(), Some("CreditLimit"));
    clerk.change_subscribe_state(&[acme()], SubscribeState::None).await.unwrap();

    let stored = manager.get(&acme(), GetOptions::revalidate()).await.unwrap();
    let main = stored.main_row().unwrap();
    assert_eq!(main.value("Company").as_str(), Some("Acme Ltd"));
    assert_eq!(main.value("CreditLimit"), &Value::Decimal(Decimal::from_i64(100)));

    let mut customer = manager.get(&acme(), GetOptions::lock()).await.unwrap();
    customer.main_row_mut().unwrap().set("CreditLimit", Decimal::new(5000, 0));
    let outcome = &manager.save(&[customer]).await.unwrap()[0];
    assert!(outcome.success && outcome.errors.is_empty(), "{outcome:?}");
    clerk.quit().await.unwrap();
    manager.quit().await.unwrap();
}

#[tokio::test]
async fn new_customers_get_keys_and_their_notes_follow() {
    init_tracing();
    let cluster = TestCluster::new(2);
    let session = cluster.connect(1, MANAGER).await.unwrap();
    let draft = Daton::new(
        DatonKey::row("Customer", -1),
        vec![Row::new()
            .with("CustomerId", -1)
            .with("Company", "Newco")
            .with_child("CustomerNote", Row::new().with("Note", "met at the fair"))
            .with_child("CustomerNote", Row::new().with("Note", "wants a quote"))],
    );
    let outcome = &session.save(&[draft]).await.unwrap()[0];
    assert!(outcome.success, "{outcome:?}");
    let key = outcome.new_key.clone().unwrap();
    assert_eq!(key, DatonKey::row("Customer", 3));

    let saved = session.cached(&key).unwrap();
    let notes = saved.main_row().unwrap().child_rows("CustomerNote");
    assert_eq!(notes.len(), 2);
    assert!(notes.iter().all(|n| n.value("CustomerId") == &Value::Int(3)));
    assert_eq!(cluster.database.row_count("CustomerNotes"), 3);
    session.quit().await.unwrap();
}

#[tokio::test]
async fn whole_table_edits_insert_and_delete_rows() {
    let cluster = TestCluster::new(1);
    let session = cluster.connect(0, MANAGER).await.unwrap();
    let key = DatonKey::whole_table("PhoneType");
    let mut phones = session.get(&key, GetOptions::lock()).await.unwrap();
    assert_eq!(phones.rows.len(), 2);
    phones.rows.retain(|r| r.value("TypeOfPhone").as_str() != Some("Office"));
    phones.rows.push(Row::new().with("TypeOfPhone", "Fax"));
    assert!(session.save(&[phones]).await.unwrap()[0].success);

    let stored = cluster
        .database
        .select(&retrodry_storage::RowQuery::table("PhoneTypes"))
        .unwrap();
    let names: Vec<_> = stored.iter().filter_map(|r| r["TypeOfPhone"].as_str()).collect();
    assert_eq!(names, vec!["Mobile", "Fax"]);
    session.quit().await.unwrap();
}

#[tokio::test]
async fn viewons_are_read_only_query_results() {
    let cluster = TestCluster::new(1);
    let session = cluster.connect(0, CLERK).await.unwrap();
    let key = DatonKey::viewon("CustomerList", [Criterion::new("Company", "Zeta")]);
    let list = session.get(&key, GetOptions::default()).await.unwrap();
    assert_eq!(list.rows.len(), 1);
    assert_eq!(list.rows[0].value("CustomerId"), &Value::Int(2));

    let errors = session
        .change_subscribe_state(&[key.clone()], SubscribeState::Locked)
        .await
        .unwrap();
    assert_eq!(errors[&key].code, ErrorCode::BadRequest);
    let outcome = &session.save(&[list]).await.unwrap()[0];
    assert!(!outcome.success);
    session.quit().await.unwrap();
}

#[tokio::test]
async fn sessions_fail_over_to_the_next_node() {
    let cluster = TestCluster::new(2);
    let session = cluster.connect(0, CLERK).await.unwrap();
    session.get(&acme(), GetOptions::default()).await.unwrap();
    cluster.take_down(0);
    let widget = session
        .get(&DatonKey::row("Widget", 1), GetOptions::default())
        .await
        .unwrap();
    assert_eq!(widget.main_row().unwrap().value("ItemCode").as_str(), Some("HEXNUT"));
    cluster.bring_up(0);
    session.quit().await.unwrap();
    assert!(!cluster.coordinator(0).session_exists(session.session_id()).unwrap());
}
