//! Throughput benchmarks for the event ledger and snapshot fold.
//!
//! Targets:
//!
//! - 10,000 events appended in under 50 ms (batched append)
//! - one snapshot over that log produced in under 200 ms

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};
use wirthforge_core::energy::EnergyDetails;
use wirthforge_core::events::EventPayload;
use wirthforge_core::ledger::EventLedger;
use wirthforge_core::reducer::EnergyAggregateReducer;
use wirthforge_core::snapshot::{SnapshotManager, SnapshotStore};

const EVENT_COUNT: u64 = 10_000;

fn token_payload(i: u64) -> EventPayload {
    let certainty = (i % 100) as f64 / 100.0;
    EventPayload::TokenEnergy(EnergyDetails {
        cadence: 1.0,
        certainty,
        stall_fraction: 0.0,
        cadence_term: 0.4,
        certainty_term: 0.4 * certainty,
        stall_term: 0.2,
    })
}

fn batch_items(count: u64) -> Vec<(f64, f64, EventPayload)> {
    (0..count)
        .map(|i| (i as f64 * 0.016, 0.5, token_payload(i)))
        .collect()
}

fn bench_append_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_append");
    group.throughput(Throughput::Elements(EVENT_COUNT));
    group.sample_size(10);

    group.bench_function("append_10k_batch", |b| {
        b.iter_batched(
            || {
                let ledger = EventLedger::in_memory().unwrap();
                let writer = ledger.writer().unwrap();
                (writer, batch_items(EVENT_COUNT))
            },
            |(mut writer, items)| {
                let events = writer.append_batch(items).unwrap();
                black_box(events.len())
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("append_1k_singly", |b| {
        b.iter_batched(
            || {
                let ledger = EventLedger::in_memory().unwrap();
                ledger.writer().unwrap()
            },
            |mut writer| {
                for i in 0..1_000u64 {
                    black_box(
                        writer
                            .append(i as f64 * 0.016, 0.5, token_payload(i))
                            .unwrap(),
                    );
                }
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

fn bench_snapshot_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    group.throughput(Throughput::Elements(EVENT_COUNT));
    group.sample_size(10);

    group.bench_function("fold_10k_from_genesis", |b| {
        let ledger = EventLedger::in_memory().unwrap();
        let mut writer = ledger.writer().unwrap();
        writer.append_batch(batch_items(EVENT_COUNT)).unwrap();

        b.iter_batched(
            || {
                SnapshotManager::new(
                    ledger.clone(),
                    SnapshotStore::in_memory().unwrap(),
                    EnergyAggregateReducer::default(),
                )
            },
            |mut manager| black_box(manager.snapshot().unwrap().frame_seq),
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_append_batch, bench_snapshot_fold);
criterion_main!(benches);
