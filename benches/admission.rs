// Admission hot path benchmarks (Criterion)
//
// Key metrics measured:
// - Pure window arithmetic
// - Limiter check against the in-memory store, by identity count
// - Limiter check against the SQLite store
//
// Usage:
//   cargo bench --bench admission

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use taskgate::clock::{Clock, SystemClock};
use taskgate::identity::Identity;
use taskgate::rate_limit::window::consume_from;
use taskgate::rate_limit::{
    Admitter, MemoryWindowStore, RateLimitConfig, RateLimiter, WindowLimits,
};
use taskgate::sqlite::SqliteStore;

fn identities(n: usize) -> Vec<Identity> {
    (0..n)
        .map(|i| Identity::new(format!("user-{}", i)).unwrap())
        .collect()
}

/// Benchmark: window consumption without any store
fn bench_window_consume(c: &mut Criterion) {
    let limits = WindowLimits {
        capacity: 20,
        window: Duration::from_secs(60),
    };
    let now = SystemClock.now();

    c.bench_function("window_consume", |b| {
        b.iter(|| black_box(consume_from(None, black_box(now), limits)));
    });
}

/// Benchmark: limiter check against the in-memory store
fn bench_memory_limiter(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("memory_limiter");

    for count in [1usize, 100, 10_000] {
        let limiter = RateLimiter::new(
            RateLimitConfig::default(),
            Arc::new(MemoryWindowStore::new()),
            Arc::new(SystemClock),
        );
        let ids = identities(count);

        group.bench_with_input(BenchmarkId::from_parameter(count), &ids, |b, ids| {
            let mut i = 0;
            b.iter(|| {
                let id = &ids[i % ids.len()];
                i += 1;
                black_box(rt.block_on(limiter.try_consume(id)).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark: limiter check against the SQLite store
fn bench_sqlite_limiter(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = SqliteStore::open_in_memory(Duration::from_secs(30)).unwrap();
    let limiter = RateLimiter::new(
        RateLimitConfig::default(),
        Arc::new(store),
        Arc::new(SystemClock),
    );
    let ids = identities(100);

    c.bench_function("sqlite_limiter", |b| {
        let mut i = 0;
        b.iter(|| {
            let id = &ids[i % ids.len()];
            i += 1;
            black_box(rt.block_on(limiter.try_consume(id)).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_window_consume,
    bench_memory_limiter,
    bench_sqlite_limiter
);
criterion_main!(benches);
