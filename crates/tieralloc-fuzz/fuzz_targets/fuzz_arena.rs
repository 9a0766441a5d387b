#![no_main]
use libfuzzer_sys::fuzz_target;
use tieralloc_core::Arena;
use tieralloc_core::config::PAGE_SIZE;

fuzz_target!(|data: &[u8]| {
    let Ok(arena) = Arena::init(vec![0u8; 64 * (PAGE_SIZE + 64)].into_boxed_slice()) else {
        return;
    };
    let total = arena.page_count();
    let mut live = Vec::new();

    // Each byte is one operation: high bit frees, the rest sizes an allocation.
    for &op in data {
        if op & 0x80 != 0 && !live.is_empty() {
            let block = live.swap_remove(usize::from(op & 0x7F) % live.len());
            arena.free(block);
        } else if op & 0x40 != 0 && !live.is_empty() {
            let index = usize::from(op) % live.len();
            if let Some(moved) = arena.reallocate(live[index], usize::from(op & 0x0F) * PAGE_SIZE) {
                live[index] = moved;
            }
        } else if let Some(block) = arena.allocate(usize::from(op & 0x3F) * 512) {
            live.push(block);
        }

        let stats = arena.stats();
        assert_eq!(stats.used_pages + stats.free_pages, total);
    }

    for block in live {
        arena.free(block);
    }
    assert_eq!(arena.stats().free_chunks, 1);
});
