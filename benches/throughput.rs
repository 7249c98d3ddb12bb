//! Throughput Benchmark for emberkv
//!
//! This benchmark measures the storage core under various workloads:
//! plain reads and writes, lock acquisition for single and multi-key
//! commands, TTL bookkeeping, and contention across threads.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use emberkv::storage::{Database, Databases, DelayScheduler, StripedLocks, Task};
use emberkv::ServerConfig;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Scheduler that drops every task, isolating the store from the wheel.
struct NoopScheduler;

impl DelayScheduler for NoopScheduler {
    fn schedule_at(&self, _at: SystemTime, _name: Bytes, _task: Task) {}
    fn cancel(&self, _name: &[u8]) {}
}

fn database() -> Database<Bytes> {
    Database::new(0, &ServerConfig::default(), Arc::new(NoopScheduler))
}

/// Benchmark PUT operations
fn bench_put(c: &mut Criterion) {
    let db = database();

    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Elements(1));

    group.bench_function("put_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i));
            db.put(key, Bytes::from("small_value"));
            i += 1;
        });
    });

    group.bench_function("put_medium", |b| {
        let mut i = 0u64;
        let value = Bytes::from("x".repeat(1024)); // 1KB value
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i));
            db.put(key, value.clone());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark GET operations
fn bench_get(c: &mut Criterion) {
    let db = database();

    // Pre-populate with data
    for i in 0..100_000 {
        db.put(
            Bytes::from(format!("key:{}", i)),
            Bytes::from(format!("value:{}", i)),
        );
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(db.get(key.as_bytes()));
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("missing:{}", i);
            black_box(db.get(key.as_bytes()));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark raw stripe acquisition for growing key sets
fn bench_locks(c: &mut Criterion) {
    let locks = StripedLocks::new(1024);

    let mut group = c.benchmark_group("locks");

    for keys in [1usize, 4, 16, 64] {
        let write: Vec<Bytes> = (0..keys).map(|i| Bytes::from(format!("w:{}", i))).collect();
        let read: Vec<Bytes> = (0..keys).map(|i| Bytes::from(format!("r:{}", i))).collect();

        group.throughput(Throughput::Elements(keys as u64));
        group.bench_with_input(BenchmarkId::new("rw_lock", keys), &keys, |b, _| {
            b.iter(|| {
                black_box(locks.rw_lock(write.as_slice(), read.as_slice()).len());
            });
        });
    }

    group.finish();
}

/// Benchmark multi-key transactions (MSET-style)
fn bench_transactions(c: &mut Criterion) {
    let db = database();
    let keys: Vec<Bytes> = (0..8).map(|i| Bytes::from(format!("mset:{}", i))).collect();

    let mut group = c.benchmark_group("transactions");
    group.throughput(Throughput::Elements(keys.len() as u64));

    group.bench_function("mset_8", |b| {
        b.iter(|| {
            db.execute(keys.as_slice(), &[] as &[&[u8]], |guard| {
                for key in &keys {
                    guard.put(key.clone(), Bytes::from("value"));
                }
            });
        });
    });

    group.bench_function("watch_and_commit", |b| {
        b.iter(|| {
            let watched = db.watch(keys.as_slice());
            let committed = db.execute(keys.as_slice(), &[] as &[&[u8]], |guard| {
                guard.unchanged_since(&watched)
            });
            black_box(committed);
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
            let db = database();
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let db = db.clone();
                    thread::spawn(move || {
                        for i in 0..10_000 {
                            let key = Bytes::from(format!("key:{}:{}", t, i));
                            db.put(key.clone(), Bytes::from("value"));
                            db.get(&key);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(db.len());
        });
    });

    group.finish();
}

/// Benchmark expiry operations against a running time wheel
fn bench_expiry(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _enter = runtime.enter();
    let dbs: Databases<Bytes> = Databases::start(&ServerConfig::default());
    let db = dbs.get(0).unwrap();

    // Pre-create keys
    for i in 0..10_000 {
        db.put(Bytes::from(format!("expire:{}", i)), Bytes::from("value"));
    }

    let mut group = c.benchmark_group("expiry");
    group.throughput(Throughput::Elements(1));

    group.bench_function("expire_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("expire:{}", i % 10_000);
            db.expire(key.as_bytes(), SystemTime::now() + Duration::from_secs(3600));
            i += 1;
        });
    });

    group.bench_function("expire_then_persist", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("expire:{}", i % 10_000);
            db.expire(key.as_bytes(), SystemTime::now() + Duration::from_secs(3600));
            black_box(db.persist(key.as_bytes()));
            i += 1;
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_put,
    bench_get,
    bench_locks,
    bench_transactions,
    bench_concurrent,
    bench_expiry,
);

criterion_main!(benches);
