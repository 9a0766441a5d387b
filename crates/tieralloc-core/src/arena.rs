//! Page-granular coalescing arena over one caller-supplied buffer.
//!
//! The buffer head holds the metadata: a page table (one `u32` per
//! page naming the chunk that owns it) followed by a fixed-capacity
//! chunk-record table. The rest, aligned to [`PAGE_SIZE`], is the
//! payload. A chunk is a maximal run of pages that is either wholly
//! free or wholly in use. Free chunks sit on a doubly-linked list sorted
//! by descending length, and adjacent free chunks are always merged.
//!
//! All mutation is serialized on one arena-wide lock.

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::backing::{self, BackingAllocator};
use crate::config::PAGE_SIZE;
use crate::error::{PoolError, Result};
use crate::lifecycle::{Component, LifecycleLog, LogLevel, Subject};

const NIL: u32 = u32::MAX;

/// Record-slot states.
const SLOT_UNUSED: u32 = 0;
const CHUNK_FREE: u32 = 1;
const CHUNK_USED: u32 = 2;

/// One chunk record, stored inside the arena buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ChunkRecord {
    start: u32,
    /// Inclusive.
    end: u32,
    length: u32,
    prev: u32,
    next: u32,
    state: u32,
}

/// Metadata cost per payload page: one page-table entry plus one record.
const META_PER_PAGE: usize = size_of::<u32>() + size_of::<ChunkRecord>();

/// Point-in-time arena occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    pub total_pages: usize,
    /// Sum of in-use chunk lengths.
    pub used_pages: usize,
    /// Sum of free-list chunk lengths.
    pub free_pages: usize,
    pub free_chunks: usize,
    pub largest_free: usize,
    /// Free-list chunk lengths, head (largest) first.
    pub free_list_lengths: Vec<usize>,
}

enum Buffer {
    Owned(*mut [u8]),
    Borrowed,
}

struct ArenaState {
    pages: NonNull<u32>,
    chunks: NonNull<ChunkRecord>,
    page_count: usize,
    largest: u32,
    smallest: u32,
    /// Lowest chunk-table slot that may be unused.
    scan_cursor: usize,
    free_chunks: usize,
    used_pages: usize,
}

// SAFETY: the raw pointers address metadata inside the arena buffer, which
// the arena owns (or the caller promised to keep alive) and which is only
// touched under the arena lock.
unsafe impl Send for ArenaState {}

/// Buddy-style page allocator over a fixed buffer.
pub struct Arena {
    payload: usize,
    page_count: usize,
    buffer: Buffer,
    state: Mutex<ArenaState>,
    log: Arc<LifecycleLog>,
}

// SAFETY: `buffer` is only used to free the allocation on drop; all other
// access goes through the mutex.
unsafe impl Send for Arena {}
// SAFETY: see above.
unsafe impl Sync for Arena {}

fn align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

impl Arena {
    /// Lays out an arena over an owned buffer.
    pub fn init(buffer: Box<[u8]>) -> Result<Self> {
        Self::init_with_log(buffer, Arc::new(LifecycleLog::new()))
    }

    pub fn init_with_log(buffer: Box<[u8]>, log: Arc<LifecycleLog>) -> Result<Self> {
        let len = buffer.len();
        let raw = Box::into_raw(buffer);
        let base = raw.cast::<u8>();
        // SAFETY: base/len describe the buffer we just took ownership of.
        match unsafe { Self::layout(base, len, log) } {
            Ok(mut arena) => {
                arena.buffer = Buffer::Owned(raw);
                Ok(arena)
            }
            Err(err) => {
                // SAFETY: raw came from Box::into_raw above and was not shared.
                drop(unsafe { Box::from_raw(raw) });
                Err(err)
            }
        }
    }

    /// Lays out an arena over memory the caller keeps ownership of.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for the
    /// whole lifetime of the arena and must not be accessed otherwise
    /// except through blocks the arena hands out.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, len: usize) -> Result<Self> {
        // SAFETY: forwarded caller contract.
        unsafe { Self::layout(base.as_ptr(), len, Arc::new(LifecycleLog::new())) }
    }

    /// Lays out an owned arena and installs it as the process-wide
    /// backing allocator.
    pub fn install(buffer: Box<[u8]>) -> Result<Arc<Self>> {
        backing::install_arena(Self::init(buffer)?)
    }

    unsafe fn layout(base: *mut u8, len: usize, log: Arc<LifecycleLog>) -> Result<Self> {
        let start = base as usize;
        let end = start.checked_add(len).ok_or(PoolError::ArenaTooSmall)?;
        let meta = align_up(start, align_of::<ChunkRecord>()).ok_or(PoolError::ArenaTooSmall)?;
        if meta >= end {
            return Err(PoolError::ArenaTooSmall);
        }

        let mut page_count = (end - meta) / (PAGE_SIZE + META_PER_PAGE);
        let payload = loop {
            if page_count < 2 {
                log.record(
                    LogLevel::Warn,
                    Component::Arena,
                    "init",
                    Subject::none().with_size(len),
                    PoolError::ArenaTooSmall.code(),
                    || "buffer cannot hold metadata plus two pages".to_string(),
                );
                return Err(PoolError::ArenaTooSmall);
            }
            let payload = align_up(meta + page_count * META_PER_PAGE, PAGE_SIZE)
                .ok_or(PoolError::ArenaTooSmall)?;
            if payload
                .checked_add(page_count * PAGE_SIZE)
                .is_some_and(|payload_end| payload_end <= end)
            {
                break payload;
            }
            page_count -= 1;
        };
        if u32::try_from(page_count).map_or(true, |n| n == NIL) {
            return Err(PoolError::InvalidConfiguration);
        }

        // The chunk table follows the page table; META_PER_PAGE keeps both
        // 4-byte aligned.
        let pages = meta as *mut u32;
        let chunks = (meta + page_count * size_of::<u32>()) as *mut ChunkRecord;
        // SAFETY: both tables lie in [meta, payload) inside the buffer and are
        // suitably aligned; they are initialized here before any read.
        let state = unsafe {
            for i in 0..page_count {
                pages.add(i).write(0);
                chunks.add(i).write(ChunkRecord {
                    start: 0,
                    end: 0,
                    length: 0,
                    prev: NIL,
                    next: NIL,
                    state: SLOT_UNUSED,
                });
            }
            chunks.write(ChunkRecord {
                start: 0,
                end: (page_count - 1) as u32,
                length: page_count as u32,
                prev: NIL,
                next: NIL,
                state: CHUNK_FREE,
            });
            ArenaState {
                pages: NonNull::new_unchecked(pages),
                chunks: NonNull::new_unchecked(chunks),
                page_count,
                largest: 0,
                smallest: 0,
                scan_cursor: 1,
                free_chunks: 1,
                used_pages: 0,
            }
        };

        log.record(
            LogLevel::Info,
            Component::Arena,
            "init",
            Subject::none().with_ptr(payload).with_size(page_count * PAGE_SIZE),
            "ok",
            || format!("pages={page_count} metadata_bytes={}", payload - start),
        );

        Ok(Self {
            payload,
            page_count,
            buffer: Buffer::Borrowed,
            state: Mutex::new(state),
            log,
        })
    }

    /// Number of payload pages.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// First payload byte.
    #[must_use]
    pub fn payload_base(&self) -> usize {
        self.payload
    }

    #[must_use]
    pub fn log(&self) -> &Arc<LifecycleLog> {
        &self.log
    }

    /// Allocates `size` bytes rounded up to whole pages, best fit.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let pages = pages_for(size);
        let mut state = self.state.lock();
        match state.allocate(pages) {
            Some(page) => Some(self.page_ptr(page)),
            None => {
                let largest = state.largest_len();
                drop(state);
                self.log.record(
                    LogLevel::Warn,
                    Component::Arena,
                    "allocate",
                    Subject::none().with_size(size),
                    "exhausted",
                    || format!("requested_pages={pages} largest_free={largest}"),
                );
                None
            }
        }
    }

    /// Returns a chunk to the free list, merging with free neighbors.
    ///
    /// # Panics
    ///
    /// If `ptr` is not the start of a live chunk of this arena.
    pub fn free(&self, ptr: NonNull<u8>) {
        let page = self.page_of(ptr);
        self.state.lock().free(page);
    }

    /// Grows a chunk in place when the following chunk is free and large
    /// enough; otherwise allocates, copies and frees. Never shrinks.
    ///
    /// # Panics
    ///
    /// If `ptr` is not the start of a live chunk of this arena.
    pub fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        let page = self.page_of(ptr);
        let wanted = pages_for(new_size);
        let mut state = self.state.lock();
        let current = state.live_length(page);
        if wanted <= current || state.grow_in_place(page, wanted) {
            return Some(ptr);
        }

        let Some(moved) = state.allocate(wanted) else {
            drop(state);
            self.log.record(
                LogLevel::Warn,
                Component::Arena,
                "reallocate",
                Subject::none().with_ptr(ptr.as_ptr() as usize).with_size(new_size),
                "exhausted",
                String::new,
            );
            return None;
        };
        let target = self.page_ptr(moved);
        // SAFETY: both chunks are live, distinct and at least `current` pages
        // long; the lock keeps them from changing during the copy.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), target.as_ptr(), current * PAGE_SIZE);
        }
        state.free(page);
        drop(state);
        self.log.record(
            LogLevel::Debug,
            Component::Arena,
            "reallocate",
            Subject::none().with_ptr(target.as_ptr() as usize).with_size(new_size),
            "copied",
            || format!("from_page={page} to_page={moved} pages={current}->{wanted}"),
        );
        Some(target)
    }

    /// Occupancy snapshot computed from the chunk records.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let state = self.state.lock();
        let mut free_list_lengths = Vec::with_capacity(state.free_chunks);
        let mut cursor = state.largest;
        while cursor != NIL {
            let chunk = state.chunk(cursor);
            free_list_lengths.push(chunk.length as usize);
            cursor = chunk.next;
        }
        let used_pages = (0..state.page_count)
            .map(|i| state.chunk(i as u32))
            .filter(|chunk| chunk.state == CHUNK_USED)
            .map(|chunk| chunk.length as usize)
            .sum();
        ArenaStats {
            total_pages: self.page_count,
            used_pages,
            free_pages: free_list_lengths.iter().sum(),
            free_chunks: free_list_lengths.len(),
            largest_free: free_list_lengths.first().copied().unwrap_or(0),
            free_list_lengths,
        }
    }

    /// Free chunks as `(start_page, length)`, ordered by start page.
    #[must_use]
    pub fn free_extents(&self) -> Vec<(usize, usize)> {
        let state = self.state.lock();
        let mut extents = Vec::new();
        let mut page = 0;
        while page < state.page_count {
            let chunk = state.chunk(state.page(page));
            if chunk.state == CHUNK_FREE {
                extents.push((chunk.start as usize, chunk.length as usize));
            }
            page = chunk.end as usize + 1;
        }
        extents
    }

    fn page_ptr(&self, page: usize) -> NonNull<u8> {
        let addr = self.payload + page * PAGE_SIZE;
        // SAFETY: payload is a non-null address inside the buffer.
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    fn page_of(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        let offset = addr.wrapping_sub(self.payload);
        assert!(
            addr >= self.payload && offset < self.page_count * PAGE_SIZE,
            "pointer {addr:#x} is outside the arena payload"
        );
        assert!(offset % PAGE_SIZE == 0, "pointer {addr:#x} is not page aligned");
        offset / PAGE_SIZE
    }
}

fn pages_for(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE).max(1)
}

impl ArenaState {
    fn page(&self, page: usize) -> u32 {
        debug_assert!(page < self.page_count);
        // SAFETY: page < page_count and the page table has page_count entries.
        unsafe { self.pages.add(page).read() }
    }

    fn set_owner(&mut self, first: u32, last: u32, owner: u32) {
        for page in first..=last {
            // SAFETY: callers pass pages of an existing chunk.
            unsafe { self.pages.add(page as usize).write(owner) };
        }
    }

    fn chunk(&self, index: u32) -> ChunkRecord {
        debug_assert!((index as usize) < self.page_count);
        // SAFETY: the chunk table has page_count records.
        unsafe { self.chunks.add(index as usize).read() }
    }

    fn chunk_mut(&mut self, index: u32) -> &mut ChunkRecord {
        debug_assert!((index as usize) < self.page_count);
        // SAFETY: as in `chunk`, and `&mut self` guarantees exclusivity.
        unsafe { &mut *self.chunks.add(index as usize).as_ptr() }
    }

    fn largest_len(&self) -> usize {
        if self.largest == NIL {
            0
        } else {
            self.chunk(self.largest).length as usize
        }
    }

    fn new_record(&mut self) -> Option<u32> {
        let slot = (self.scan_cursor..self.page_count)
            .find(|&i| self.chunk(i as u32).state == SLOT_UNUSED)?;
        self.scan_cursor = slot + 1;
        Some(slot as u32)
    }

    fn release_record(&mut self, index: u32) {
        *self.chunk_mut(index) = ChunkRecord {
            start: 0,
            end: 0,
            length: 0,
            prev: NIL,
            next: NIL,
            state: SLOT_UNUSED,
        };
        self.scan_cursor = self.scan_cursor.min(index as usize);
    }

    fn unlink(&mut self, index: u32) {
        let ChunkRecord { prev, next, .. } = self.chunk(index);
        if prev == NIL {
            self.largest = next;
        } else {
            self.chunk_mut(prev).next = next;
        }
        if next == NIL {
            self.smallest = prev;
        } else {
            self.chunk_mut(next).prev = prev;
        }
        let chunk = self.chunk_mut(index);
        chunk.prev = NIL;
        chunk.next = NIL;
        self.free_chunks -= 1;
    }

    /// Inserts a free chunk after every strictly longer one.
    fn insert(&mut self, index: u32) {
        let length = self.chunk(index).length;
        let mut cursor = self.largest;
        while cursor != NIL && self.chunk(cursor).length > length {
            cursor = self.chunk(cursor).next;
        }
        let prev = if cursor == NIL {
            self.smallest
        } else {
            self.chunk(cursor).prev
        };
        {
            let chunk = self.chunk_mut(index);
            chunk.state = CHUNK_FREE;
            chunk.prev = prev;
            chunk.next = cursor;
        }
        if prev == NIL {
            self.largest = index;
        } else {
            self.chunk_mut(prev).next = index;
        }
        if cursor == NIL {
            self.smallest = index;
        } else {
            self.chunk_mut(cursor).prev = index;
        }
        self.free_chunks += 1;
    }

    /// Smallest free chunk with at least `pages` pages, walking up from the
    /// tail of the descending list.
    fn best_fit(&self, pages: usize) -> Option<u32> {
        let mut cursor = self.smallest;
        while cursor != NIL {
            let chunk = self.chunk(cursor);
            if chunk.length as usize >= pages {
                return Some(cursor);
            }
            cursor = chunk.prev;
        }
        None
    }

    /// Returns the first page of the allocated chunk.
    fn allocate(&mut self, pages: usize) -> Option<usize> {
        let found = self.best_fit(pages)?;
        let chunk = self.chunk(found);
        let want = pages as u32;
        let allocated = if chunk.length == want {
            self.unlink(found);
            found
        } else {
            // The new record takes the shorter piece so fewer page entries
            // are rewritten.
            let record = self.new_record()?;
            self.unlink(found);
            let remainder = chunk.length - want;
            if want <= remainder {
                *self.chunk_mut(record) = ChunkRecord {
                    start: chunk.start,
                    end: chunk.start + want - 1,
                    length: want,
                    prev: NIL,
                    next: NIL,
                    state: CHUNK_USED,
                };
                self.set_owner(chunk.start, chunk.start + want - 1, record);
                let rest = self.chunk_mut(found);
                rest.start += want;
                rest.length = remainder;
                self.insert(found);
                record
            } else {
                *self.chunk_mut(record) = ChunkRecord {
                    start: chunk.start + want,
                    end: chunk.end,
                    length: remainder,
                    prev: NIL,
                    next: NIL,
                    state: CHUNK_FREE,
                };
                self.set_owner(chunk.start + want, chunk.end, record);
                let head = self.chunk_mut(found);
                head.end = chunk.start + want - 1;
                head.length = want;
                self.insert(record);
                found
            }
        };
        self.chunk_mut(allocated).state = CHUNK_USED;
        self.used_pages += pages;
        Some(self.chunk(allocated).start as usize)
    }

    /// Length of the live chunk starting at `page`.
    fn live_length(&self, page: usize) -> usize {
        let chunk = self.chunk(self.page(page));
        assert!(
            chunk.state == CHUNK_USED && chunk.start as usize == page,
            "page {page} is not the start of a live arena chunk"
        );
        chunk.length as usize
    }

    fn free(&mut self, page: usize) {
        let length = self.live_length(page);
        let mut index = self.page(page);
        self.used_pages -= length;
        self.chunk_mut(index).state = CHUNK_FREE;

        let chunk = self.chunk(index);
        if chunk.start > 0 {
            let before = self.page(chunk.start as usize - 1);
            if self.chunk(before).state == CHUNK_FREE {
                self.unlink(before);
                index = self.merge(index, before);
            }
        }
        let chunk = self.chunk(index);
        if (chunk.end as usize) + 1 < self.page_count {
            let after = self.page(chunk.end as usize + 1);
            if self.chunk(after).state == CHUNK_FREE {
                self.unlink(after);
                index = self.merge(index, after);
            }
        }
        self.insert(index);
    }

    /// Merges two adjacent unlinked free chunks. The longer record
    /// survives; the other's pages are rewritten and its slot released.
    fn merge(&mut self, a: u32, b: u32) -> u32 {
        let (keep, absorb) = if self.chunk(a).length >= self.chunk(b).length {
            (a, b)
        } else {
            (b, a)
        };
        let gone = self.chunk(absorb);
        self.set_owner(gone.start, gone.end, keep);
        let survivor = self.chunk_mut(keep);
        survivor.start = survivor.start.min(gone.start);
        survivor.end = survivor.end.max(gone.end);
        survivor.length += gone.length;
        self.release_record(absorb);
        keep
    }

    /// Extends the live chunk at `page` into its free successor.
    fn grow_in_place(&mut self, page: usize, wanted: usize) -> bool {
        let index = self.page(page);
        let chunk = self.chunk(index);
        let next_page = chunk.end as usize + 1;
        if next_page >= self.page_count {
            return false;
        }
        let after = self.page(next_page);
        let next = self.chunk(after);
        let need = (wanted - chunk.length as usize) as u32;
        if next.state != CHUNK_FREE || next.length < need {
            return false;
        }

        self.unlink(after);
        self.set_owner(next.start, next.start + need - 1, index);
        if next.length == need {
            self.release_record(after);
        } else {
            let rest = self.chunk_mut(after);
            rest.start += need;
            rest.length -= need;
            self.insert(after);
        }
        let grown = self.chunk_mut(index);
        grown.end += need;
        grown.length += need;
        self.used_pages += need as usize;
        true
    }
}

impl BackingAllocator for Arena {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        Arena::allocate(self, size)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        Arena::free(self, ptr);
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        Arena::reallocate(self, ptr, new_size)
    }

    fn name(&self) -> &'static str {
        "arena"
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Buffer::Owned(raw) = self.buffer {
            // SAFETY: raw came from Box::into_raw in init and is freed once.
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("payload", &format_args!("{:#x}", self.payload))
            .field("page_count", &self.page_count)
            .finish()
    }
}
