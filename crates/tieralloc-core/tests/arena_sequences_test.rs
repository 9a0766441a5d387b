//! Randomized arena sequences: page conservation, coalescing back to a
//! single chunk, and non-overlapping payloads.

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::sync::Arc;

use tieralloc_core::config::PAGE_SIZE;
use tieralloc_core::lifecycle::{LifecycleLog, LogLevel};
use tieralloc_core::{Arena, PoolError};

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

#[derive(Debug)]
struct Block {
    ptr: NonNull<u8>,
    pages: usize,
    tag: u8,
}

fn arena(pages: usize) -> Arena {
    let bytes = pages * (PAGE_SIZE + 64) + 2 * PAGE_SIZE;
    let log = Arc::new(LifecycleLog::with_threshold(Some(LogLevel::Debug), 1024));
    Arena::init_with_log(vec![0u8; bytes].into_boxed_slice(), log).expect("arena init")
}

fn stamp(block: &Block) {
    // SAFETY: the block is a live chunk of `pages` pages.
    unsafe { std::ptr::write_bytes(block.ptr.as_ptr(), block.tag, block.pages * PAGE_SIZE) };
}

fn verify(block: &Block) {
    // SAFETY: the block is a live chunk of `pages` pages.
    let bytes = unsafe { std::slice::from_raw_parts(block.ptr.as_ptr(), block.pages * PAGE_SIZE) };
    assert!(
        bytes.iter().all(|&b| b == block.tag),
        "chunk at {:p} was overwritten",
        block.ptr
    );
}

#[test]
fn too_small_buffer_is_rejected() {
    let err = Arena::init(vec![0u8; PAGE_SIZE].into_boxed_slice()).unwrap_err();
    assert_eq!(err, PoolError::ArenaTooSmall);
}

#[test]
fn random_churn_conserves_pages_and_coalesces() {
    for seed in [0x9E37_79B9_7F4A_7C15, 0xDEAD_BEEF, 42] {
        let arena = arena(256);
        let total = arena.page_count();
        let mut rng = XorShift64::new(seed);
        let mut live: Vec<Block> = Vec::new();
        let mut tag = 0u8;

        for _ in 0..4000 {
            let stats = arena.stats();
            assert_eq!(stats.used_pages + stats.free_pages, total, "seed={seed:#x} {stats:?}");

            if live.is_empty() || rng.gen_range(0, 99) < 55 {
                let pages = rng.gen_range(1, 12);
                let size = pages * PAGE_SIZE - rng.gen_range(0, PAGE_SIZE - 1);
                match arena.allocate(size) {
                    Some(ptr) => {
                        tag = tag.wrapping_add(1);
                        let block = Block { ptr, pages, tag };
                        stamp(&block);
                        live.push(block);
                    }
                    None => assert!(stats.largest_free < pages, "best fit missed a chunk: {stats:?}"),
                }
            } else {
                let victim = live.swap_remove(rng.gen_range(0, live.len() - 1));
                verify(&victim);
                arena.free(victim.ptr);
            }
        }

        for block in live.drain(..) {
            verify(&block);
            arena.free(block.ptr);
        }
        let stats = arena.stats();
        assert_eq!(stats.free_chunks, 1, "free list did not coalesce: {stats:?}");
        assert_eq!(stats.largest_free, total);
        assert_eq!(arena.free_extents(), vec![(0, total)]);
    }
}

#[test]
fn no_two_free_chunks_are_adjacent() {
    let arena = arena(128);
    let mut rng = XorShift64::new(7);
    let mut live = Vec::new();
    for _ in 0..40 {
        if let Some(ptr) = arena.allocate(rng.gen_range(1, 4) * PAGE_SIZE) {
            live.push(ptr);
        }
    }
    for i in (0..live.len()).step_by(3) {
        arena.free(live[i]);
    }
    let extents = arena.free_extents();
    for pair in extents.windows(2) {
        let (start, len) = pair[0];
        assert!(start + len < pair[1].0, "adjacent free chunks {pair:?}");
    }
}

#[test]
fn reallocate_preserves_contents_across_moves() {
    let arena = arena(64);
    let first = arena.allocate(PAGE_SIZE).expect("first");
    let blocker = arena.allocate(PAGE_SIZE).expect("blocker");
    let block = Block {
        ptr: first,
        pages: 1,
        tag: 0x5A,
    };
    stamp(&block);

    let moved = arena.reallocate(first, 3 * PAGE_SIZE).expect("moved");
    assert_ne!(moved, first, "neighbor is in use so the chunk must move");
    verify(&Block {
        ptr: moved,
        pages: 1,
        tag: 0x5A,
    });
    assert!(
        arena.log().records().iter().any(|r| r.event == "reallocate" && r.outcome == "copied"),
        "fallback copy is logged"
    );

    arena.free(blocker);
    arena.free(moved);
    assert_eq!(arena.stats().free_chunks, 1);
}

#[test]
fn exhaustion_returns_none_and_logs() {
    let arena = arena(16);
    let total = arena.page_count();
    let all = arena.allocate(total * PAGE_SIZE).expect("whole arena");
    assert!(arena.allocate(1).is_none());
    assert!(
        arena.log().records().iter().any(|r| r.level == LogLevel::Warn && r.outcome == "exhausted")
    );
    arena.free(all);
    assert!(arena.allocate(1).is_some());
}

#[test]
fn failed_reallocate_keeps_the_old_chunk() {
    let arena = arena(16);
    let total = arena.page_count();
    let first = arena.allocate(PAGE_SIZE).expect("first");
    let rest = arena.allocate((total - 1) * PAGE_SIZE).expect("rest");
    let block = Block {
        ptr: first,
        pages: 1,
        tag: 0xA7,
    };
    stamp(&block);

    assert!(arena.reallocate(first, 2 * PAGE_SIZE).is_none());
    verify(&block);
    let stats = arena.stats();
    assert_eq!(stats.used_pages, total);
    assert_eq!(stats.free_pages, 0);
    assert!(
        arena.log().records().iter().any(|r| r.event == "reallocate" && r.outcome == "exhausted")
    );

    arena.free(first);
    assert_eq!(arena.stats().used_pages, total - 1);
    arena.free(rest);
    assert_eq!(arena.stats().free_chunks, 1);
}
