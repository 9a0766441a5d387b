#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use super::BackingAllocator;
use crate::config::MIN_BACKING_ALIGN;

/// Header in front of each block holding its total layout size, so that
/// `free` does not need the caller to remember it.
const HEADER: usize = MIN_BACKING_ALIGN;

/// Host-allocator backing (`std::alloc`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBacking;

fn layout_for(total: usize) -> Option<Layout> {
    Layout::from_size_align(total, MIN_BACKING_ALIGN).ok()
}

impl BackingAllocator for SystemBacking {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let total = size.checked_add(HEADER)?;
        let layout = layout_for(total)?;
        // SAFETY: layout has non-zero size (HEADER > 0).
        let raw = NonNull::new(unsafe { alloc::alloc(layout) })?;
        // SAFETY: raw is valid for `total >= HEADER` bytes and 16-aligned.
        unsafe {
            raw.cast::<usize>().write(total);
            Some(raw.add(HEADER))
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        // SAFETY: ptr was produced by allocate/reallocate, so its header sits
        // HEADER bytes before it and records the layout size.
        unsafe {
            let raw = ptr.sub(HEADER);
            let total = raw.cast::<usize>().read();
            alloc::dealloc(
                raw.as_ptr(),
                Layout::from_size_align_unchecked(total, MIN_BACKING_ALIGN),
            );
        }
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        let new_total = new_size.checked_add(HEADER)?;
        layout_for(new_total)?;
        // SAFETY: same header contract as free; std::alloc::realloc leaves the
        // old block intact when it returns null.
        unsafe {
            let raw = ptr.sub(HEADER);
            let total = raw.cast::<usize>().read();
            let old = Layout::from_size_align_unchecked(total, MIN_BACKING_ALIGN);
            let moved = NonNull::new(alloc::realloc(raw.as_ptr(), old, new_total))?;
            moved.cast::<usize>().write(new_total);
            Some(moved.add(HEADER))
        }
    }

    fn name(&self) -> &'static str {
        "system"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_aligned_and_writable() {
        let backing = SystemBacking;
        let ptr = backing.allocate(100).unwrap();
        assert_eq!(ptr.as_ptr() as usize % MIN_BACKING_ALIGN, 0);
        // SAFETY: ptr is valid for 100 bytes.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x5A, 100);
            backing.free(ptr);
        }
    }

    #[test]
    fn reallocate_preserves_prefix() {
        let backing = SystemBacking;
        let ptr = backing.allocate(16).unwrap();
        // SAFETY: ptr is valid for 16 bytes, then for 4096 after reallocate.
        unsafe {
            for i in 0..16u8 {
                ptr.as_ptr().add(i as usize).write(i);
            }
            let grown = backing.reallocate(ptr, 4096).unwrap();
            for i in 0..16u8 {
                assert_eq!(grown.as_ptr().add(i as usize).read(), i);
            }
            backing.free(grown);
        }
    }

    #[test]
    fn zero_sized_requests_get_a_block() {
        let backing = SystemBacking;
        let ptr = backing.allocate(0).unwrap();
        // SAFETY: ptr came from allocate.
        unsafe { backing.free(ptr) };
    }
}
