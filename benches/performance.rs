use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;
use vigia::config::Config;
use vigia::core::memory::{replica_status_document, MemoryConnector, MemoryStore};
use vigia::core::ConnectionStrategy;
use vigia::health::{HealthPolicy, QuorumPolicy, TopologySnapshot};
use vigia::routing::ConnectionManager;

/// Replica-set status reply with `count` members
fn status_with_members(count: usize) -> mongodb::bson::Document {
    let names: Vec<String> = (0..count).map(|i| format!("db-{}:27017", i)).collect();
    let members: Vec<(&str, i32, bool)> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), if i == 0 { 1 } else { 2 }, i % 5 != 4))
        .collect();
    replica_status_document("rs0", &members)
}

/// Topology normalization and classification
fn bench_topology(c: &mut Criterion) {
    let mut group = c.benchmark_group("topology");
    let policy = QuorumPolicy::default();

    for member_count in [3, 7, 50].iter() {
        let status = status_with_members(*member_count);

        group.bench_with_input(
            BenchmarkId::new("parse_status", member_count),
            &status,
            |b, status| {
                b.iter(|| black_box(TopologySnapshot::from_status(black_box(status))));
            },
        );

        let snapshot = TopologySnapshot::from_status(&status).unwrap();
        group.bench_with_input(
            BenchmarkId::new("classify", member_count),
            &snapshot,
            |b, snapshot| {
                b.iter(|| black_box(policy.classify(black_box(snapshot), None)));
            },
        );
    }

    group.finish();
}

/// Handle lookups once a connection set is live
fn bench_facade(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut config = Config::default();
    config.bootstrap.enabled = false;

    let connector = Arc::new(MemoryConnector::new(MemoryStore::new()));
    let manager = ConnectionManager::new(connector, &config);
    rt.block_on(manager.establish()).unwrap();

    let mut group = c.benchmark_group("facade");

    group.bench_function("for_write", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(manager.for_write().await.unwrap()) });
    });

    group.bench_function("for_read", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(manager.for_read().await.unwrap()) });
    });

    group.bench_function("strategy_ladder", |b| {
        b.iter(|| black_box(ConnectionStrategy::ladder(black_box(&config))));
    });

    group.finish();
}

criterion_group!(benches, bench_topology, bench_facade);
criterion_main!(benches);
