//! Performance benchmarks for the subscription engine.

use archive_subscriber::handlers::AppContext;
use archive_subscriber::{
    keys, ClientSessionFactory, Connector, EngineFactory, EngineId, EventKind, FileResult, Handler,
    HandlerDispatchTable, HandlerRegistry, ManagerConfig, PersistenceConfig, PushQueue, ReconnectThrottle,
    Result, SessionClient, SessionPersistenceStore, SessionTarget, SubscriptionError, SubscriptionManager,
    SubscriptionParameters, TaskType, ThrottleConfig,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tempfile::TempDir;

struct Noop;

impl Handler for Noop {
    fn name(&self) -> &str {
        "noop"
    }

    fn handle_event(&self, _task_type: TaskType, results: &[FileResult]) -> Result<()> {
        black_box(results.len());
        Ok(())
    }
}

struct Offline;

impl Connector for Offline {
    fn open(&self, _target: &SessionTarget) -> Result<Box<dyn SessionClient>> {
        Err(SubscriptionError::Connection("offline".into()))
    }
}

/// Benchmark handler dispatch with varying table sizes
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let files: Vec<FileResult> = (0..16).map(|i| FileResult::ok(format!("f{i}"), "RAW")).collect();

    for handlers in [1, 8, 64] {
        group.bench_with_input(BenchmarkId::new("handlers", handlers), &handlers, |b, &n| {
            let table = HandlerDispatchTable::new();
            for _ in 0..n {
                table.add(EventKind::Success, Arc::new(Noop));
            }
            b.iter(|| black_box(table.dispatch(EventKind::Success, TaskType::Notification, &files)));
        });
    }

    group.finish();
}

/// Benchmark a full offer/advance/commit cycle of the push queue
fn bench_push_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_queue");

    for batch in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &n| {
            let queue = PushQueue::new(n);
            b.iter(|| {
                for i in 0..n {
                    queue.offer(FileResult::ok(format!("f{i}"), "RAW"));
                }
                for event in queue.advance() {
                    queue.commit(event.seq);
                }
            });
        });
    }

    group.finish();
}

/// Benchmark atomic store commits with varying session counts
fn bench_store_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_commit");
    group.sample_size(20);

    for sessions in [1, 50, 500] {
        group.bench_with_input(BenchmarkId::new("sessions", sessions), &sessions, |b, &n| {
            let dir = TempDir::new().unwrap();
            let store = SessionPersistenceStore::open(PersistenceConfig {
                dir: dir.path().to_path_buf(),
                name: "bench".to_string(),
            })
            .unwrap();
            for i in 0..n {
                let params = SubscriptionParameters::subscription(&format!("T{i}"), "/data")
                    .with(keys::KEEP_ALIVE, true)
                    .with(keys::INTERVAL, 300);
                store.put_parameters(EngineId(i as u64), &params);
            }
            b.iter(|| store.commit().unwrap());
        });
    }

    group.finish();
}

/// Benchmark manager lookups with varying engine counts
fn bench_manager_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("manager_lookup");

    for engines in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("engines", engines), &engines, |b, &n| {
            let throttle = Arc::new(ReconnectThrottle::new("bench", ThrottleConfig::default()));
            let sessions = Arc::new(ClientSessionFactory::new(Arc::new(Offline), throttle));
            let factory = Arc::new(EngineFactory::new(
                Arc::new(HandlerRegistry::new(AppContext::new("bench"))),
                sessions,
            ));
            let manager = SubscriptionManager::with_factory(ManagerConfig::default(), Arc::clone(&factory), None);
            for i in 0..n {
                let engine = factory
                    .build(SubscriptionParameters::notification(&format!("T{}", i % 10)), None)
                    .unwrap();
                engine.update_parameter(keys::OUTPUT_DIRECTORY, format!("/out/{i}")).unwrap();
                manager.add(&engine).unwrap();
            }
            let probe = EngineId(n as u64 / 2);

            b.iter(|| {
                black_box(manager.by_source("T3"));
                black_box(manager.by_id(probe));
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_dispatch,
    bench_push_queue,
    bench_store_commit,
    bench_manager_lookup
);
criterion_main!(benches);
