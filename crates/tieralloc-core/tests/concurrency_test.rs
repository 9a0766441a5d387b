//! Thread-protected pools shared across threads.

#![allow(unsafe_code)]

use std::ops::ControlFlow;
use std::ptr::NonNull;
use std::sync::{Arc, Barrier};
use std::thread;

use tieralloc_core::lifecycle::{LifecycleLog, LogLevel};
use tieralloc_core::{Allocator, PoolDescriptor, PoolError, PoolOptions, backing};

const THREADS: usize = 8;
const ROUNDS: usize = 2000;

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

/// Pool object address carried across threads.
#[derive(Clone, Copy, Debug)]
struct Addr(usize);

impl Addr {
    fn ptr(self) -> NonNull<u8> {
        NonNull::new(self.0 as *mut u8).expect("pool objects are non-null")
    }
}

fn shared_context() -> Arc<Allocator> {
    Arc::new(Allocator::with_backing_and_log(
        backing::system(),
        Arc::new(LifecycleLog::with_threshold(Some(LogLevel::Warn), 1024)),
    ))
}

#[test]
fn protected_fixed_pool_hands_out_distinct_objects() {
    let ctx = shared_context();
    let pool = ctx
        .fixed()
        .init(16, 6, PoolOptions::THREAD_PROTECTION, PoolDescriptor::named("shared"))
        .unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let ctx = Arc::clone(&ctx);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng = XorShift64::new(0x5EED ^ t as u64);
                let mut held: Vec<(Addr, u64)> = Vec::new();
                barrier.wait();
                for round in 0..ROUNDS {
                    if held.is_empty() || rng.gen_range(0, 2) > 0 {
                        let object = ctx.fixed().pop(pool).expect("pop");
                        let stamp = ((t as u64) << 32) | round as u64;
                        // SAFETY: a fresh 16-byte object owned by this thread.
                        unsafe { object.cast::<u64>().write(stamp) };
                        held.push((Addr(object.as_ptr() as usize), stamp));
                    } else {
                        let (addr, stamp) = held.swap_remove(rng.gen_range(0, held.len() - 1));
                        // SAFETY: still owned by this thread until the push.
                        let seen = unsafe { addr.ptr().cast::<u64>().read() };
                        assert_eq!(seen, stamp, "object shared between threads");
                        ctx.fixed().push(pool, addr.ptr()).expect("push");
                    }
                }
                held
            })
        })
        .collect();

    let mut outstanding = 0;
    for worker in workers {
        let held = worker.join().expect("worker panicked");
        for (addr, stamp) in &held {
            // SAFETY: the joined thread no longer touches its objects.
            assert_eq!(unsafe { addr.ptr().cast::<u64>().read() }, *stamp);
        }
        outstanding += held.len();
        for (addr, _) in held {
            ctx.fixed().push(pool, addr.ptr()).unwrap();
        }
    }
    let stats = ctx.fixed().stats(pool).unwrap();
    assert_eq!(stats.objects_out, 0);
    assert!(stats.peak_objects_out >= outstanding);
    assert!(ctx.log().records().is_empty(), "no warnings: {:?}", ctx.log().records());
}

#[test]
fn protected_variable_pool_under_contention() {
    let ctx = shared_context();
    let pool = ctx
        .variable_pool_with_defaults(PoolOptions::THREAD_PROTECTION, PoolDescriptor::named("shared-var"))
        .unwrap();

    thread::scope(|scope| {
        for t in 0..THREADS {
            let ctx = &ctx;
            scope.spawn(move || {
                let mut rng = XorShift64::new(0xBEEF + t as u64);
                let mut held: Vec<(Addr, usize)> = Vec::new();
                for _ in 0..ROUNDS {
                    if held.is_empty() || rng.gen_range(0, 3) > 1 {
                        let size = rng.gen_range(1, 3000);
                        let object = ctx.variable().pop(pool, size).expect("pop");
                        // SAFETY: the object holds `size` bytes.
                        unsafe { std::ptr::write_bytes(object.as_ptr(), t as u8, size) };
                        held.push((Addr(object.as_ptr() as usize), size));
                    } else {
                        let (addr, size) = held.swap_remove(rng.gen_range(0, held.len() - 1));
                        // SAFETY: owned by this thread until the push.
                        let data = unsafe { std::slice::from_raw_parts(addr.ptr().as_ptr(), size) };
                        assert!(data.iter().all(|&b| b == t as u8), "object shared between threads");
                        ctx.variable().push(pool, addr.ptr()).expect("push");
                    }
                }
                for (addr, _) in held {
                    ctx.variable().push(pool, addr.ptr()).expect("drain");
                }
            });
        }
    });

    let stats = ctx.variable().stats(pool).unwrap();
    assert_eq!(stats.overflow_objects, 0);
    assert!(stats.classes.iter().all(|c| c.pool.objects_out == 0));
}

#[test]
fn unprotected_pool_reports_contention_instead_of_racing() {
    let ctx = shared_context();
    let pool = ctx
        .fixed()
        .init(8, 6, PoolOptions::NONE, PoolDescriptor::named("unprotected"))
        .unwrap();
    let object = ctx.fixed().pop(pool).unwrap();

    // The walk holds the pool lock while another thread tries to pop.
    let inner = thread::scope(|scope| {
        let ctx = &ctx;
        ctx.fixed()
            .walk(pool, |_| {
                let popped = scope
                    .spawn(move || ctx.fixed().pop(pool).map(|o| o.as_ptr() as usize))
                    .join()
                    .expect("join");
                ControlFlow::Break(popped)
            })
            .unwrap()
    });
    assert_eq!(inner, ControlFlow::Break(Err(PoolError::Contended)));
    ctx.fixed().push(pool, object).unwrap();
}
