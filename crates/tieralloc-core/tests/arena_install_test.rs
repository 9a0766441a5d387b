//! Process-wide arena installation. Kept in its own test binary because
//! the installation cannot be undone.

use std::sync::Arc;

use tieralloc_core::backing::{self, BackingAllocator};
use tieralloc_core::config::PAGE_SIZE;
use tieralloc_core::{Allocator, Arena, PoolDescriptor, PoolError, PoolOptions};

#[test]
fn installed_arena_backs_new_contexts_until_exhausted() {
    assert_eq!(backing::active().name(), "system");

    let arena = Arena::install(vec![0u8; 96 * (PAGE_SIZE + 64)].into_boxed_slice()).expect("install");
    let again = Arena::init(vec![0u8; 8 * PAGE_SIZE].into_boxed_slice()).expect("second arena");
    assert_eq!(backing::install_arena(again).unwrap_err(), PoolError::AlreadyInstalled);
    assert!(Arc::ptr_eq(&backing::installed_arena().expect("installed"), &arena));
    assert_eq!(backing::active().name(), "arena");

    let total = arena.stats().total_pages;
    {
        let ctx = Allocator::new();
        assert_eq!(ctx.backing().name(), "arena");
        let pool = ctx
            .fixed()
            .init(512, 6, PoolOptions::NONE, PoolDescriptor::named("pages"))
            .expect("init");

        let mut popped = Vec::new();
        let err = loop {
            match ctx.fixed().pop(pool) {
                Ok(object) => popped.push(object),
                Err(err) => break err,
            }
            assert!(popped.len() < 1_000_000, "arena never ran out");
        };
        assert_eq!(err, PoolError::NoMoreMemory);
        assert!(!popped.is_empty());
        assert_eq!(ctx.fixed().last_error(pool).unwrap(), Some(PoolError::NoMoreMemory));
        for &object in &popped {
            let addr = object.as_ptr() as usize;
            assert!(addr >= arena.payload_base() && addr < arena.payload_base() + total * PAGE_SIZE);
        }

        ctx.fixed().free_all(pool).unwrap();
        assert!(ctx.fixed().pop(pool).is_ok(), "free_all returned slabs to the arena");
    }

    let stats = arena.stats();
    assert_eq!(stats.used_pages, 0, "dropping the context released everything: {stats:?}");
    assert_eq!(stats.free_chunks, 1);
}
