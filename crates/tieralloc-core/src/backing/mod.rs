//! Backing allocators.
//!
//! Every pool and slot table obtains its raw memory from a
//! [`BackingAllocator`]. The default delegates to the host allocator;
//! an [`Arena`] can be installed once per process to serve everything
//! created afterwards from one pre-reserved buffer.

#![allow(unsafe_code)]

mod extent;
mod system;

use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

pub use extent::Extent;
pub use system::SystemBacking;

use crate::arena::Arena;
use crate::error::{PoolError, Result};

/// Allocate/free/reallocate triple behind every tier.
///
/// Returned blocks are aligned to at least
/// [`MIN_BACKING_ALIGN`](crate::config::MIN_BACKING_ALIGN) bytes.
pub trait BackingAllocator: Send + Sync {
    /// Allocates `size` bytes, `None` when exhausted.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Releases a block.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate`/`reallocate` on this allocator and
    /// must not have been freed already.
    unsafe fn free(&self, ptr: NonNull<u8>);

    /// Grows or shrinks a block, possibly moving it. On `None` the old
    /// block is untouched and still owned by the caller.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free).
    unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>>;

    /// Short name for diagnostics.
    fn name(&self) -> &'static str;
}

static INSTALLED_ARENA: OnceLock<Arc<Arena>> = OnceLock::new();
static SYSTEM: OnceLock<Arc<dyn BackingAllocator>> = OnceLock::new();

/// Installs `arena` as the process-wide backing allocator.
///
/// There is no uninstall. Blocks obtained earlier keep returning to the
/// allocator that produced them.
pub fn install_arena(arena: Arena) -> Result<Arc<Arena>> {
    let arena = Arc::new(arena);
    INSTALLED_ARENA
        .set(Arc::clone(&arena))
        .map_err(|_| PoolError::AlreadyInstalled)?;
    Ok(arena)
}

/// The installed arena, if any.
#[must_use]
pub fn installed_arena() -> Option<Arc<Arena>> {
    INSTALLED_ARENA.get().cloned()
}

/// The shared host-allocator backing.
#[must_use]
pub fn system() -> Arc<dyn BackingAllocator> {
    Arc::clone(SYSTEM.get_or_init(|| Arc::new(SystemBacking)))
}

/// The active backing allocator: the installed arena, else the host.
#[must_use]
pub fn active() -> Arc<dyn BackingAllocator> {
    match INSTALLED_ARENA.get() {
        Some(arena) => Arc::clone(arena) as Arc<dyn BackingAllocator>,
        None => system(),
    }
}
