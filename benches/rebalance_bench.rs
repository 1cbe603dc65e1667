//! Criterion micro-benchmarks for the assignment hot paths.
//!
//! These benchmarks measure:
//! - Full rebalance planning at growing cluster shapes
//! - Key-to-segment hashing and path escaping
//!
//! Run with: `cargo bench --bench rebalance_bench`

use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use menagerie::cluster::{
    Address, DataCenterAware, MemberSet, PartitionKey, PartitionMap, RebalanceContext,
    RebalancePolicy,
};
use menagerie::zk;

fn members(count: u16) -> MemberSet {
    (0..count)
        .map(|n| Address::new(format!("10.{}.0.{n}", n % 3), 9000))
        .collect()
}

fn scenario(partitions: usize, size: u32) -> (PartitionMap, BTreeMap<PartitionKey, u32>) {
    let mut current = PartitionMap::new();
    let mut required = BTreeMap::new();
    for i in 0..partitions {
        let key = PartitionKey::from(format!("partition-{i}").as_bytes());
        current.insert(key.clone(), MemberSet::new());
        required.insert(key, size);
    }
    (current, required)
}

fn bench_plan(c: &mut Criterion) {
    let resolver = Arc::new(|a: &Address| a.host.split('.').nth(1).unwrap_or("0").to_string());
    let policy = DataCenterAware::new(false, resolver);

    let mut group = c.benchmark_group("rebalance_plan");
    for (partitions, member_count) in [(64usize, 4u16), (256, 8), (1024, 16)] {
        let members = members(member_count);
        let (current, required) = scenario(partitions, 3);
        group.throughput(Throughput::Elements(partitions as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{partitions}p_{member_count}m")),
            &(current, required, members),
            |b, (current, required, members)| {
                b.iter(|| {
                    policy.plan(RebalanceContext {
                        current: black_box(current),
                        members: black_box(members),
                        required: black_box(required),
                        leader: None,
                    })
                })
            },
        );
    }
    group.finish();
}

fn bench_key_encoding(c: &mut Criterion) {
    let printable = b"orders-2024-08-eu-central".as_slice();
    let binary: Vec<u8> = (0u8..=255).collect();

    let mut group = c.benchmark_group("key_encoding");
    group.bench_function("segment_of", |b| {
        b.iter(|| zk::segment_of(black_box(printable), black_box(128)))
    });
    group.bench_function("escape_printable", |b| {
        b.iter(|| zk::key_to_path(black_box(printable)))
    });
    group.bench_function("escape_binary", |b| {
        b.iter(|| zk::key_to_path(black_box(&binary)))
    });
    group.bench_function("unescape_round_trip", |b| {
        let encoded = zk::key_to_path(&binary);
        b.iter(|| zk::path_to_key(black_box(&encoded)).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_plan, bench_key_encoding);
criterion_main!(benches);
