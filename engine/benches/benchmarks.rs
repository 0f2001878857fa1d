//! Performance benchmarks for converge-engine

use converge_engine::{
    kept_prefix, partition_filter, partition_payloads, plan_keyed, Category, FieldDef, FieldKind,
    KeyedState, PolicyRules, Record, Rule, Shape, Slot, StateSnapshot,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};

fn host_shape() -> Shape {
    Shape::new(vec![
        FieldDef::plain("address"),
        FieldDef::plain("port"),
        FieldDef::computed("updatedAt"),
        FieldDef::new("tags", FieldKind::Set(Shape::default())),
    ])
}

fn host(i: usize) -> Record {
    Record::new()
        .with_field("address", format!("10.0.{}.{}", i / 256, i % 256))
        .with_field("port", 443)
        .with_field("tags", json!(["edge", format!("zone-{}", i % 4)]))
}

fn keyed_state(size: usize) -> KeyedState {
    (0..size)
        .map(|i| (format!("host-{i}"), host(i).with_remote_id(i.to_string())))
        .collect()
}

fn policy(size: usize) -> PolicyRules {
    let categories: Vec<Category> = (0..4)
        .map(|i| Category::new(format!("cat-{i}"), Record::new().with_remote_id(format!("c{i}"))))
        .collect();
    let rules = (0..size)
        .map(|i| {
            Rule::new(
                format!("cat-{}", i * 4 / size.max(1)),
                "top",
                Record::new()
                    .with_field("name", format!("rule-{i}"))
                    .with_field("action", "allow")
                    .with_remote_id(format!("r{i}")),
            )
        })
        .collect();
    PolicyRules::new(categories, rules)
}

fn bench_partitioning(c: &mut Criterion) {
    let mut group = c.benchmark_group("partitioning");

    for size in [100, 1000, 10000].iter() {
        let payloads: Vec<Value> = (0..*size)
            .map(|i| json!({"name": format!("host-{i}"), "address": "10.0.0.1", "port": 443}))
            .collect();
        group.bench_with_input(BenchmarkId::new("payloads", size), &payloads, |b, payloads| {
            b.iter(|| partition_payloads(black_box(payloads), black_box(16 * 1024)))
        });

        let ids: Vec<String> = (0..*size).map(|i| format!("{i:08x}")).collect();
        group.bench_with_input(BenchmarkId::new("filter", size), &ids, |b, ids| {
            b.iter(|| partition_filter(black_box(ids), black_box(2048)))
        });
    }

    group.finish();
}

fn bench_plan_keyed(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_keyed");
    let shape = host_shape();

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("unchanged", size), size, |b, &size| {
            let observed = keyed_state(size);
            let desired = observed.clone();
            b.iter(|| plan_keyed(black_box(&shape), black_box(&desired), black_box(&observed)))
        });

        group.bench_with_input(BenchmarkId::new("half_replaced", size), size, |b, &size| {
            let observed = keyed_state(size);
            let mut desired = keyed_state(size / 2);
            desired.extend(
                (size..size + size / 2).map(|i| (format!("host-{i}"), host(i))),
            );
            b.iter(|| plan_keyed(black_box(&shape), black_box(&desired), black_box(&observed)))
        });
    }

    group.finish();
}

fn bench_kept_prefix(c: &mut Criterion) {
    let mut group = c.benchmark_group("kept_prefix");
    let rule_shape = Shape::new(vec![FieldDef::plain("name"), FieldDef::plain("action")]);
    let category_shape = Shape::default();

    for size in [100, 1000, 5000].iter() {
        group.bench_with_input(BenchmarkId::new("diverge_at_end", size), size, |b, &size| {
            let observed = policy(size);
            let mut desired = observed.clone();
            if let Some(last) = desired.rules.last_mut() {
                last.record.set_field("action", Slot::Known(json!("deny")));
            }
            b.iter(|| {
                kept_prefix(
                    black_box(&category_shape),
                    black_box(&rule_shape),
                    black_box(&desired),
                    black_box(&observed),
                )
            })
        });
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [100, 1000].iter() {
        let mut snapshot = StateSnapshot::new();
        snapshot.set_collection("hosts", keyed_state(*size));
        snapshot.set_policy("default", policy(*size));
        let json = snapshot.to_json().unwrap();

        group.bench_with_input(BenchmarkId::new("to_json", size), &snapshot, |b, snapshot| {
            b.iter(|| snapshot.to_json())
        });
        group.bench_with_input(BenchmarkId::new("from_json", size), &json, |b, json| {
            b.iter(|| StateSnapshot::from_json(black_box(json)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_partitioning,
    bench_plan_keyed,
    bench_kept_prefix,
    bench_snapshot,
);
criterion_main!(benches);
