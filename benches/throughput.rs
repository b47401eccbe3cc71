//! Throughput Benchmark for relaykv
//!
//! Measures the keyspace, request decoding and the replicated write path.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relaykv::protocol::{decode_commands, RespValue};
use relaykv::replication::{ReplicationManager, ReplicationState};
use relaykv::storage::{RespSnapshot, SnapshotFormat, StorageEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Benchmark SET operations
fn bench_set(c: &mut Criterion) {
    let engine = Arc::new(StorageEngine::new());

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i));
            engine.set(key, Bytes::from("small_value"));
            i += 1;
        });
    });

    group.bench_function("set_with_ttl", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("ttl:{}", i));
            engine.set_with_ttl(key, Bytes::from("value"), Duration::from_secs(3600));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark GET operations
fn bench_get(c: &mut Criterion) {
    let engine = Arc::new(StorageEngine::new());

    for i in 0..100_000 {
        let key = Bytes::from(format!("key:{}", i));
        let value = Bytes::from(format!("value:{}", i));
        engine.set(key, value);
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i % 100_000));
            black_box(engine.get(&key));
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("missing:{}", i));
            black_box(engine.get(&key));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark decoding a pipelined batch of requests
fn bench_decode(c: &mut Criterion) {
    let mut batch = Vec::new();
    for i in 0..100 {
        RespValue::command([
            "SET".to_string(),
            format!("key:{}", i),
            "x".repeat(64),
        ])
        .serialize_into(&mut batch);
    }

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(100));

    group.bench_function("pipelined_100_sets", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&batch[..]);
            black_box(decode_commands(&mut buf));
        });
    });

    group.finish();
}

/// Benchmark the replicated write path with attached replicas
fn bench_commit_write(c: &mut Criterion) {
    let peer: SocketAddr = "127.0.0.1:6380".parse().unwrap();

    let mut group = c.benchmark_group("replication");
    group.throughput(Throughput::Elements(1));

    for replicas in [0usize, 1, 4] {
        let manager = ReplicationManager::new(
            Arc::new(ReplicationState::master()),
            Arc::new(StorageEngine::new()),
        );
        // Drained every iteration, so the default capacity never fills
        let mut feeds: Vec<_> = (0..replicas)
            .map(|_| manager.begin_full_resync(peer, None).unwrap().feed)
            .collect();

        group.bench_function(format!("commit_write_{}_replicas", replicas), |b| {
            let mut i = 0u64;
            b.iter(|| {
                let key = format!("key:{}", i);
                let frame = RespValue::command(["SET".to_string(), key.clone(), "v".to_string()]);
                manager.commit_write(&frame, |store| {
                    store.set(Bytes::from(key), Bytes::from("v"))
                });
                for feed in feeds.iter_mut() {
                    black_box(feed.try_recv().ok());
                }
                i += 1;
            });
        });
    }

    group.finish();
}

/// Benchmark taking and encoding a full snapshot
fn bench_snapshot(c: &mut Criterion) {
    let engine = StorageEngine::new();
    for i in 0..10_000 {
        engine.set(Bytes::from(format!("key:{}", i)), Bytes::from("value"));
    }

    let mut group = c.benchmark_group("snapshot");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("snapshot_and_encode_10k", |b| {
        b.iter(|| {
            let entries = engine.snapshot_all();
            black_box(RespSnapshot.encode(&entries));
        });
    });

    group.finish();
}

/// Benchmark concurrent access
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        b.iter(|| {
            let engine = Arc::new(StorageEngine::new());
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let engine = Arc::clone(&engine);
                    thread::spawn(move || {
                        for i in 0..10_000 {
                            let key = Bytes::from(format!("key:{}:{}", t, i));
                            engine.set(key.clone(), Bytes::from("value"));
                            engine.get(&key);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(engine.len());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_decode,
    bench_commit_write,
    bench_snapshot,
    bench_concurrent,
);

criterion_main!(benches);
