use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use std::hint::black_box;
use tasksync_core::{ChangeEvent, RawChange, Record, Row};

fn sample_row(i: usize) -> tasksync_core::RawRow {
    json!({
        "id": i,
        "content": format!("Task {i}"),
        "status": "In Progress",
        "assignee": "ayse",
        "priority": "medium",
        "due_date": "2025-06-30",
        "project_id": "p-1",
        "extra_data": {"Sprint": "12", "Estimate": 3, "Owner": null},
        "updated_at": "2025-05-01 10:00:00.123+00",
        "last_updated_by": "ayse@example.com",
    })
    .as_object()
    .cloned()
    .unwrap_or_default()
}

fn bench_from_raw(c: &mut Criterion) {
    let mut group = c.benchmark_group("Normalization");
    group.throughput(Throughput::Elements(1));

    let row = sample_row(1);
    group.bench_function("record_from_raw", |b| {
        b.iter(|| black_box(Record::from_raw(black_box(&row))))
    });

    let change = RawChange::update(sample_row(2));
    group.bench_function("change_event_from_raw", |b| {
        b.iter(|| black_box(ChangeEvent::<Record>::from_raw(black_box(&change))))
    });

    group.finish();
}

fn bench_bulk_fetch(c: &mut Criterion) {
    let mut group = c.benchmark_group("Normalization");
    let rows: Vec<_> = (0..1000).map(sample_row).collect();
    group.throughput(Throughput::Elements(rows.len() as u64));

    group.bench_function("fetch_1000_rows", |b| {
        b.iter(|| {
            let records: Vec<Record> = rows.iter().filter_map(|r| Record::from_raw(r).ok()).collect();
            black_box(records)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_from_raw, bench_bulk_fetch);
criterion_main!(benches);
