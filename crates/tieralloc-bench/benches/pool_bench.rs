//! Pool benchmarks.
//!
//! Fixed pools against the host `malloc`, and variable-pool pop/push and
//! resize across the default size classes.

use std::ptr::NonNull;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tieralloc_core::{Allocator, PoolDescriptor, PoolOptions};

const SIZES: &[usize] = &[8, 64, 256, 1000];

fn bench_fixed_vs_malloc(c: &mut Criterion) {
    let ctx = Allocator::new();
    let mut group = c.benchmark_group("fixed_pop_push");

    for &size in SIZES {
        let pool = ctx
            .fixed()
            .init(size, 10, PoolOptions::NONE, PoolDescriptor::named("bench"))
            .expect("init");
        group.bench_with_input(BenchmarkId::new("fixed", size), &size, |b, _| {
            b.iter(|| {
                let object = ctx.fixed().pop(pool).expect("pop");
                ctx.fixed().push(pool, criterion::black_box(object)).expect("push");
            });
        });
        group.bench_with_input(BenchmarkId::new("malloc", size), &size, |b, &sz| {
            b.iter(|| {
                // SAFETY: plain malloc/free pair on a block we never dereference.
                unsafe {
                    let object = libc::malloc(sz);
                    libc::free(criterion::black_box(object));
                }
            });
        });
        ctx.fixed().clean(pool).expect("clean");
    }
    group.finish();
}

fn bench_fixed_burst(c: &mut Criterion) {
    let ctx = Allocator::new();
    let pool = ctx
        .fixed()
        .init(64, 8, PoolOptions::NONE, PoolDescriptor::named("burst"))
        .expect("init");
    let mut group = c.benchmark_group("fixed_burst");
    group.bench_function("1000x64B", |b| {
        b.iter(|| {
            let objects: Vec<NonNull<u8>> = (0..1000).map(|_| ctx.fixed().pop(pool).expect("pop")).collect();
            for object in objects {
                ctx.fixed().push(pool, object).expect("push");
            }
        });
    });
    group.bench_function("1000x64B_protected", |b| {
        let protected = ctx
            .fixed()
            .init(64, 8, PoolOptions::THREAD_PROTECTION, PoolDescriptor::named("burst-protected"))
            .expect("init");
        b.iter(|| {
            let objects: Vec<NonNull<u8>> = (0..1000)
                .map(|_| ctx.fixed().pop(protected).expect("pop"))
                .collect();
            for object in objects {
                ctx.fixed().push(protected, object).expect("push");
            }
        });
    });
    group.finish();
}

fn bench_variable(c: &mut Criterion) {
    let ctx = Allocator::new();
    let pool = ctx
        .variable_pool_with_defaults(PoolOptions::NONE, PoolDescriptor::named("bench-var"))
        .expect("init");
    let mut group = c.benchmark_group("variable");

    for &size in &[8usize, 100, 900, 4096] {
        group.bench_with_input(BenchmarkId::new("pop_push", size), &size, |b, &sz| {
            b.iter(|| {
                let object = ctx.variable().pop(pool, sz).expect("pop");
                ctx.variable().push(pool, criterion::black_box(object)).expect("push");
            });
        });
    }
    group.bench_function("resize_16_to_2048", |b| {
        b.iter(|| {
            let mut object = ctx.variable().pop(pool, 16).expect("pop");
            let mut size = 16;
            while size < 2048 {
                size *= 2;
                object = ctx.variable().resize(pool, Some(object), size).expect("resize");
            }
            ctx.variable().push(pool, object).expect("push");
        });
    });
    group.finish();
}

criterion_group!(benches, bench_fixed_vs_malloc, bench_fixed_burst, bench_variable);
criterion_main!(benches);
