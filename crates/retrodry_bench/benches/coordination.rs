//! Coordination store benchmarks.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use retrodry_core::DatonKey;
use retrodry_storage::{Change, CoordinationStore, InMemoryCoordinationStore, SessionRecord};

fn store_with_sessions(count: usize) -> InMemoryCoordinationStore {
    let store = InMemoryCoordinationStore::new();
    for i in 0..count {
        store
            .create_session(SessionRecord {
                id: format!("s{i}"),
                user: format!("user{i}"),
                roles: Vec::new(),
                language: "en".to_string(),
                last_activity: Utc::now(),
                cursor: 0,
            })
            .unwrap();
    }
    store
}

/// Benchmark lock acquisition and release.
fn bench_lock(c: &mut Criterion) {
    let store = store_with_sessions(2);
    let key = DatonKey::row("Customer", 1);

    c.bench_function("lock_release", |b| {
        b.iter(|| {
            let outcome = store.try_lock(black_box(&key), "s0").unwrap();
            store.unsubscribe(&key, "s0").unwrap();
            black_box(outcome);
        });
    });
}

/// Benchmark a save's version swap plus change-log append.
fn bench_record_save(c: &mut Criterion) {
    let store = store_with_sessions(1);
    let key = DatonKey::row("Customer", 1);
    let mut version = store.ensure_version(&key, "v0".to_string()).unwrap();
    let mut n = 0u64;

    c.bench_function("record_save", |b| {
        b.iter(|| {
            n += 1;
            let next = format!("v{n}");
            assert!(store.set_version(&key, Some(&version), next.clone()).unwrap());
            store
                .append_change(Change::DatonSaved {
                    key: key.clone(),
                    version: next.clone(),
                    origin_session: "s0".to_string(),
                })
                .unwrap();
            version = next;
        });
    });
}

/// Benchmark reading the change log with many subscribers.
fn bench_changes_since(c: &mut Criterion) {
    let mut group = c.benchmark_group("changes_since");

    for pending in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*pending as u64));
        let store = store_with_sessions(100);
        for i in 0..*pending {
            store
                .append_change(Change::DatonSaved {
                    key: DatonKey::row("Customer", i as i64),
                    version: format!("v{i}"),
                    origin_session: "s0".to_string(),
                })
                .unwrap();
        }
        group.bench_with_input(BenchmarkId::from_parameter(pending), pending, |b, &pending| {
            b.iter(|| black_box(store.changes_since(0, pending).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_lock, bench_record_save, bench_changes_since);

criterion_main!(benches);
