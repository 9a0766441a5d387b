#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use super::BackingAllocator;

/// One block obtained from a backing allocator, released on drop.
///
/// Ownership checks (`contains`, `offset_of`) are plain integer range
/// comparisons over `(base, len)` and never dereference anything.
pub struct Extent {
    ptr: NonNull<u8>,
    len: usize,
    backing: Arc<dyn BackingAllocator>,
}

// SAFETY: an Extent is the unique owner of its block, and the backing
// allocator it returns the block to is Send + Sync.
unsafe impl Send for Extent {}
// SAFETY: shared access only exposes the address and length.
unsafe impl Sync for Extent {}

impl Extent {
    /// Allocates `len` bytes from `backing`.
    #[must_use]
    pub fn allocate(backing: &Arc<dyn BackingAllocator>, len: usize) -> Option<Self> {
        let ptr = backing.allocate(len)?;
        Some(Self {
            ptr,
            len,
            backing: Arc::clone(backing),
        })
    }

    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn backing(&self) -> &Arc<dyn BackingAllocator> {
        &self.backing
    }

    /// Whether `addr` lies in `[base, base + len)`.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.offset_of(addr).is_some()
    }

    /// Offset of `addr` from the base, if inside the extent.
    #[must_use]
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        addr.checked_sub(self.base()).filter(|&offset| offset < self.len)
    }

    /// Reallocates to `new_len` bytes. On failure the extent is unchanged.
    pub fn resize(&mut self, new_len: usize) -> bool {
        // SAFETY: self.ptr is a live block of self.backing.
        match unsafe { self.backing.reallocate(self.ptr, new_len) } {
            Some(ptr) => {
                self.ptr = ptr;
                self.len = new_len;
                true
            }
            None => false,
        }
    }

    /// Writes `byte` over `[offset, offset + len)`.
    pub fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "fill range {offset}+{len} outside extent of {} bytes",
            self.len
        );
        // SAFETY: the range was checked against the block length above.
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr().add(offset), byte, len) };
    }
}

impl Drop for Extent {
    fn drop(&mut self) {
        // SAFETY: the block is live and owned solely by this extent.
        unsafe { self.backing.free(self.ptr) };
    }
}

impl fmt::Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extent")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("len", &self.len)
            .field("backing", &self.backing.name())
            .finish()
    }
}
