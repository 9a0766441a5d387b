#![no_main]
use libfuzzer_sys::fuzz_target;
use tieralloc_core::{Allocator, PoolDescriptor, PoolError, PoolOptions, backing};

fuzz_target!(|data: &[u8]| {
    let ctx = Allocator::with_backing(backing::system());
    let Ok(pool) = ctx.variable_pool_with_defaults(PoolOptions::NONE, PoolDescriptor::default()) else {
        return;
    };
    let mut live = Vec::new();

    for pair in data.chunks(2) {
        let op = pair[0];
        let arg = usize::from(pair.get(1).copied().unwrap_or(0));
        match op % 4 {
            0 | 1 => {
                let size = if op & 0x80 != 0 { arg * 64 } else { arg };
                if let Ok(object) = ctx.variable().pop(pool, size) {
                    live.push(object);
                }
            }
            2 if !live.is_empty() => {
                let index = arg % live.len();
                let moved = ctx
                    .variable()
                    .resize(pool, Some(live[index]), arg * 24)
                    .expect("resize of a live object");
                live[index] = moved;
            }
            3 if !live.is_empty() => {
                let object = live.swap_remove(arg % live.len());
                ctx.variable().push(pool, object).expect("push of a live object");
                // The second push must be refused, never corrupt the pool.
                assert_eq!(ctx.variable().push(pool, object), Err(PoolError::DoublePush));
            }
            _ => {}
        }
    }

    ctx.variable().free_all(pool).expect("free_all");
    ctx.variable().clean(pool).expect("clean");
});
