//! Wire codec benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use retrodry_bench::utils::{customer_with_notes, NOTE_COUNTS};
use retrodry_core::wire::{decode_daton, encode_daton};
use retrodry_core::Encoding;
use retrodry_testkit::customer_def;

/// Benchmark encoding in both encodings.
fn bench_encode(c: &mut Criterion) {
    let def = customer_def();
    let mut group = c.benchmark_group("encode");

    for notes in NOTE_COUNTS.iter() {
        group.throughput(Throughput::Elements(*notes as u64 + 1));
        let daton = customer_with_notes(*notes);
        for (name, encoding) in [("verbose", Encoding::Verbose), ("dense", Encoding::Dense)] {
            group.bench_with_input(BenchmarkId::new(name, notes), &daton, |b, daton| {
                b.iter(|| black_box(encode_daton(&def, black_box(daton), encoding)));
            });
        }
    }

    group.finish();
}

/// Benchmark decoding in both encodings.
fn bench_decode(c: &mut Criterion) {
    let def = customer_def();
    let mut group = c.benchmark_group("decode");

    for notes in NOTE_COUNTS.iter() {
        group.throughput(Throughput::Elements(*notes as u64 + 1));
        let daton = customer_with_notes(*notes);
        for (name, encoding) in [("verbose", Encoding::Verbose), ("dense", Encoding::Dense)] {
            let json = encode_daton(&def, &daton, encoding);
            group.bench_with_input(BenchmarkId::new(name, notes), &json, |b, json| {
                b.iter(|| black_box(decode_daton(&def, black_box(json), true).unwrap()));
            });
        }
    }

    group.finish();
}

/// Benchmark the text form clients actually send.
fn bench_text_roundtrip(c: &mut Criterion) {
    let def = customer_def();
    let daton = customer_with_notes(100);

    c.bench_function("text_roundtrip_100", |b| {
        b.iter(|| {
            let text = encode_daton(&def, black_box(&daton), Encoding::Dense).to_string();
            let json = serde_json::from_str(&text).unwrap();
            black_box(decode_daton(&def, &json, true).unwrap());
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_text_roundtrip);

criterion_main!(benches);
