//! Growable indexed slot table with stable handles.
//!
//! Slots live in segments obtained from a [`BackingAllocator`]; growth
//! appends a new segment and never moves existing slots, so a handle's
//! storage address is stable until the slot is freed. A `u32` bitmap
//! word per 32-slot group tracks free slots (1 = free). All scans run in
//! ascending handle order.

#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::ops::{Bound, RangeBounds};
use std::ptr::NonNull;
use std::sync::Arc;

use serde::Serialize;

use crate::backing::{BackingAllocator, Extent};
use crate::bitmap::{BitWord, Bitmap};
use crate::config::{MIN_BACKING_ALIGN, POISON_FRESH_SLOTS, POISON_RELEASED, SLOT_GROUP};
use crate::error::{PoolError, Result};
use crate::lifecycle::{Component, LifecycleLog, LogLevel, Subject};

/// Stable index of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SlotHandle(usize);

impl SlotHandle {
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

struct Segment {
    first: usize,
    slots: usize,
    storage: Extent,
}

/// Growable table of `T` slots addressed by [`SlotHandle`].
pub struct SlotTable<T> {
    backing: Arc<dyn BackingAllocator>,
    segments: Vec<Segment>,
    bitmap: Option<Bitmap<u32>>,
    capacity: usize,
    live: usize,
    /// Lowest bitmap word that may contain a free bit.
    scan_cursor: usize,
    poison: bool,
    log: Option<Arc<LifecycleLog>>,
    _slot: PhantomData<T>,
}

fn round_to_group(count: usize) -> Option<usize> {
    count.checked_next_multiple_of(SLOT_GROUP)
}

fn range_bounds(range: &impl RangeBounds<usize>, capacity: usize) -> (usize, usize) {
    let start = match range.start_bound() {
        Bound::Included(&s) => s,
        Bound::Excluded(&s) => s.saturating_add(1),
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(&e) => e.saturating_add(1),
        Bound::Excluded(&e) => e,
        Bound::Unbounded => capacity,
    };
    (start.min(capacity), end.min(capacity))
}

impl<T> SlotTable<T> {
    pub fn new(backing: Arc<dyn BackingAllocator>) -> Self {
        const {
            assert!(
                align_of::<T>() <= MIN_BACKING_ALIGN,
                "slot alignment exceeds backing alignment"
            );
        }
        Self {
            backing,
            segments: Vec::new(),
            bitmap: None,
            capacity: 0,
            live: 0,
            scan_cursor: 0,
            poison: false,
            log: None,
            _slot: PhantomData,
        }
    }

    /// Fills fresh capacity and released slots with marker bytes.
    #[must_use]
    pub fn with_poison(mut self, poison: bool) -> Self {
        self.poison = poison;
        self
    }

    /// Records growth and gc in `log`.
    #[must_use]
    pub fn with_log(mut self, log: Arc<LifecycleLog>) -> Self {
        self.log = Some(log);
        self
    }

    #[must_use]
    pub const fn slot_size(&self) -> usize {
        size_of::<T>()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[must_use]
    pub fn is_allocated(&self, handle: SlotHandle) -> bool {
        let index = handle.0;
        index < self.capacity && self.bitmap.as_ref().is_some_and(|bitmap| !bitmap.is_free(index))
    }

    /// Stores `value` in the lowest free slot, growing by one group if full.
    pub fn alloc_one(&mut self, value: T) -> Result<SlotHandle> {
        let index = match self.find_free() {
            Some(index) => index,
            None => {
                self.grow(SLOT_GROUP)?;
                self.find_free().ok_or(PoolError::OutOfMemory)?
            }
        };
        self.occupy(index, value);
        Ok(SlotHandle(index))
    }

    /// Allocates `count` consecutive handles, filling slot `base + i` with
    /// `init(i)`. Growth adds at least `count + 1` slots so a run exists.
    pub fn alloc_run(&mut self, count: usize, mut init: impl FnMut(usize) -> T) -> Result<SlotHandle> {
        if count == 0 {
            return Err(PoolError::InvalidConfiguration);
        }
        let base = match self.find_run(count) {
            Some(base) => base,
            None => {
                let extra = count.checked_add(1).ok_or(PoolError::OutOfMemory)?;
                self.grow(extra)?;
                self.find_run(count).ok_or(PoolError::OutOfMemory)?
            }
        };
        for offset in 0..count {
            self.occupy(base + offset, init(offset));
        }
        Ok(SlotHandle(base))
    }

    #[must_use]
    pub fn get(&self, handle: SlotHandle) -> Option<&T> {
        if !self.is_allocated(handle) {
            return None;
        }
        // SAFETY: allocated slots hold an initialized T.
        Some(unsafe { &*self.slot_ptr(handle.0).as_ptr() })
    }

    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut T> {
        if !self.is_allocated(handle) {
            return None;
        }
        // SAFETY: allocated slots hold an initialized T; `&mut self` is exclusive.
        Some(unsafe { &mut *self.slot_ptr(handle.0).as_ptr() })
    }

    /// Frees one slot and returns its value.
    pub fn free_one(&mut self, handle: SlotHandle) -> Option<T> {
        if !self.is_allocated(handle) {
            return None;
        }
        Some(self.vacate(handle.0))
    }

    /// Frees `count` slots starting at `handle`. Nothing is freed unless
    /// every slot in the run is allocated.
    pub fn free_run(&mut self, handle: SlotHandle, count: usize) -> Result<()> {
        let end = handle.0.checked_add(count).ok_or(PoolError::InvalidHandle)?;
        if count == 0 || !(handle.0..end).all(|index| self.is_allocated(SlotHandle(index))) {
            return Err(PoolError::InvalidHandle);
        }
        for index in handle.0..end {
            drop(self.vacate(index));
        }
        Ok(())
    }

    /// Every allocated handle, ascending.
    pub fn handles(&self) -> impl Iterator<Item = SlotHandle> + '_ {
        self.allocated_between(0, self.capacity)
    }

    fn allocated_between(&self, start: usize, end: usize) -> impl Iterator<Item = SlotHandle> + '_ {
        let words = self.bitmap.as_ref().map_or(&[][..], |bitmap| bitmap.words());
        let mut index = start;
        std::iter::from_fn(move || {
            while index < end {
                let word = words[index / SLOT_GROUP];
                if index % SLOT_GROUP == 0 && word == u32::ALL_FREE {
                    index += SLOT_GROUP;
                    continue;
                }
                let current = index;
                index += 1;
                if !word.is_free(current % SLOT_GROUP) {
                    return Some(SlotHandle(current));
                }
            }
            None
        })
    }

    /// Every allocated slot, ascending.
    pub fn iter(&self) -> impl Iterator<Item = (SlotHandle, &T)> + '_ {
        self.handles().filter_map(|handle| self.get(handle).map(|value| (handle, value)))
    }

    /// Visits allocated slots in `range` in ascending order and sums the
    /// visitor's results.
    pub fn walk(
        &self,
        range: impl RangeBounds<usize>,
        mut visitor: impl FnMut(SlotHandle, &T) -> usize,
    ) -> usize {
        let (start, end) = range_bounds(&range, self.capacity);
        self.allocated_between(start, end)
            .filter_map(|handle| self.get(handle).map(|value| visitor(handle, value)))
            .sum()
    }

    /// First allocated slot in `range`, ascending, matching `predicate`.
    pub fn search(
        &self,
        range: impl RangeBounds<usize>,
        mut predicate: impl FnMut(SlotHandle, &T) -> bool,
    ) -> Option<(SlotHandle, &T)> {
        let (start, end) = range_bounds(&range, self.capacity);
        self.allocated_between(start, end)
            .filter_map(|handle| self.get(handle).map(|value| (handle, value)))
            .find(|(handle, value)| predicate(*handle, *value))
    }

    pub fn search_mut(
        &mut self,
        range: impl RangeBounds<usize>,
        predicate: impl FnMut(SlotHandle, &T) -> bool,
    ) -> Option<(SlotHandle, &mut T)> {
        let (handle, _) = self.search(range, predicate)?;
        self.get_mut(handle).map(|value| (handle, value))
    }

    /// Drops every value and releases all storage.
    pub fn clear(&mut self) {
        if std::mem::needs_drop::<T>() {
            let live: Vec<SlotHandle> = self.handles().collect();
            for handle in live {
                // SAFETY: each handle is allocated and dropped exactly once.
                unsafe { std::ptr::drop_in_place(self.slot_ptr(handle.0).as_ptr()) };
            }
        }
        self.segments.clear();
        self.bitmap = None;
        self.capacity = 0;
        self.live = 0;
        self.scan_cursor = 0;
    }

    /// Releases trailing groups with no allocated slot. Returns whether the
    /// table shrank. Fails when the backing allocator refuses the smaller
    /// bitmap or the shrink of the last kept segment; the table is then
    /// left exactly as it was.
    pub fn gc(&mut self) -> Result<bool> {
        let Some(bitmap) = self.bitmap.as_ref() else {
            return Ok(false);
        };
        let keep_words = bitmap
            .words()
            .iter()
            .rposition(|&word| word != u32::ALL_FREE)
            .map_or(0, |last| last + 1);
        let keep = keep_words * SLOT_GROUP;
        if keep == self.capacity {
            return Ok(false);
        }
        if keep == 0 {
            let released = self.capacity;
            self.clear();
            self.log_event(LogLevel::Debug, "gc", "shrunk", released);
            return Ok(true);
        }

        // Fallible steps first; nothing is dropped until both succeed.
        let Some(mut shrunk) = Bitmap::new(&self.backing, keep_words, u32::ALL_FREE) else {
            return self.gc_failed(keep);
        };
        shrunk.words_mut().copy_from_slice(&bitmap.words()[..keep_words]);
        let kept_segments = self.segments.partition_point(|segment| segment.first < keep);
        if let Some(last) = self.segments[..kept_segments].last_mut() {
            let slots = keep - last.first;
            if slots < last.slots {
                if !last.storage.resize(slots * size_of::<T>()) {
                    return self.gc_failed(keep);
                }
                last.slots = slots;
            }
        }

        let released = self.capacity - keep;
        self.segments.truncate(kept_segments);
        self.bitmap = Some(shrunk);
        self.capacity = keep;
        self.scan_cursor = self.scan_cursor.min(keep_words);
        self.log_event(LogLevel::Debug, "gc", "shrunk", released);
        Ok(true)
    }

    fn gc_failed(&self, keep: usize) -> Result<bool> {
        let err = PoolError::OutOfMemory;
        self.log_event(LogLevel::Warn, "gc", err.code(), self.capacity - keep);
        Err(err)
    }

    /// `slots` is the number of slots gained or released.
    fn log_event(&self, level: LogLevel, event: &'static str, outcome: &'static str, slots: usize) {
        if let Some(log) = &self.log {
            log.record(level, Component::SlotTable, event, Subject::none(), outcome, || {
                format!(
                    "slots={slots} capacity={} live={} slot_size={}",
                    self.capacity,
                    self.live,
                    size_of::<T>()
                )
            });
        }
    }

    fn find_free(&mut self) -> Option<usize> {
        let bitmap = self.bitmap.as_ref()?;
        let words = bitmap.words();
        while self.scan_cursor < words.len() {
            if let Some(bit) = words[self.scan_cursor].first_free() {
                return Some(self.scan_cursor * SLOT_GROUP + bit);
            }
            self.scan_cursor += 1;
        }
        None
    }

    fn find_run(&self, count: usize) -> Option<usize> {
        self.bitmap
            .as_ref()?
            .find_free_run(self.scan_cursor * SLOT_GROUP, count)
    }

    fn grow(&mut self, extra: usize) -> Result<()> {
        let extra = round_to_group(extra).ok_or(PoolError::OutOfMemory)?;
        let bytes = extra.checked_mul(size_of::<T>()).ok_or(PoolError::OutOfMemory)?;
        let mut storage = Extent::allocate(&self.backing, bytes).ok_or(PoolError::OutOfMemory)?;
        if self.poison {
            storage.fill(0, bytes, POISON_FRESH_SLOTS);
        }
        let words = (self.capacity + extra) / SLOT_GROUP;
        match self.bitmap.as_mut() {
            Some(bitmap) => {
                if !bitmap.resize(words, u32::ALL_FREE) {
                    return Err(PoolError::OutOfMemory);
                }
            }
            None => {
                self.bitmap =
                    Some(Bitmap::new(&self.backing, words, u32::ALL_FREE).ok_or(PoolError::OutOfMemory)?);
            }
        }
        self.segments.push(Segment {
            first: self.capacity,
            slots: extra,
            storage,
        });
        self.capacity += extra;
        self.log_event(LogLevel::Debug, "grow", "ok", extra);
        Ok(())
    }

    fn slot_ptr(&self, index: usize) -> NonNull<T> {
        let at = self.segments.partition_point(|segment| segment.first + segment.slots <= index);
        let segment = &self.segments[at];
        debug_assert!(index >= segment.first && index < segment.first + segment.slots);
        // SAFETY: index lies inside this segment, whose storage holds `slots`
        // slots of T.
        unsafe {
            segment
                .storage
                .as_ptr()
                .add((index - segment.first) * size_of::<T>())
                .cast::<T>()
        }
    }

    fn occupy(&mut self, index: usize, value: T) {
        // SAFETY: the slot is free, so it holds no live value to overwrite.
        unsafe { self.slot_ptr(index).as_ptr().write(value) };
        if let Some(bitmap) = self.bitmap.as_mut() {
            bitmap.mark_used(index);
        }
        self.live += 1;
    }

    fn vacate(&mut self, index: usize) -> T {
        let slot = self.slot_ptr(index);
        // SAFETY: the slot is allocated; marking it free below ends its life.
        let value = unsafe { slot.as_ptr().read() };
        if self.poison && size_of::<T>() > 0 {
            // SAFETY: the slot's bytes are ours and the value was moved out.
            unsafe { std::ptr::write_bytes(slot.as_ptr().cast::<u8>(), POISON_RELEASED, size_of::<T>()) };
        }
        if let Some(bitmap) = self.bitmap.as_mut() {
            bitmap.mark_free(index);
        }
        self.live -= 1;
        self.scan_cursor = self.scan_cursor.min(index / SLOT_GROUP);
        value
    }
}

impl<T> Drop for SlotTable<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T> std::fmt::Debug for SlotTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotTable")
            .field("slot_size", &size_of::<T>())
            .field("capacity", &self.capacity)
            .field("live", &self.live)
            .field("segments", &self.segments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{SystemBacking, system};
    use std::rc::Rc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Host allocator whose allocate and reallocate can be switched off.
    #[derive(Default)]
    struct Refusing {
        allocate: AtomicBool,
        reallocate: AtomicBool,
    }

    impl BackingAllocator for Refusing {
        fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
            if self.allocate.load(Ordering::Relaxed) {
                return None;
            }
            SystemBacking.allocate(size)
        }

        unsafe fn free(&self, ptr: NonNull<u8>) {
            // SAFETY: forwarded under the caller's contract.
            unsafe { SystemBacking.free(ptr) }
        }

        unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
            if self.reallocate.load(Ordering::Relaxed) {
                return None;
            }
            // SAFETY: forwarded under the caller's contract.
            unsafe { SystemBacking.reallocate(ptr, new_size) }
        }

        fn name(&self) -> &'static str {
            "refusing"
        }
    }

    fn table<T>() -> SlotTable<T> {
        SlotTable::new(system())
    }

    #[test]
    fn alloc_one_grows_by_group() {
        let mut t = table::<u64>();
        let h = t.alloc_one(7).unwrap();
        assert_eq!(h.index(), 0);
        assert_eq!(t.capacity(), SLOT_GROUP);
        assert_eq!(t.get(h), Some(&7));
        for i in 1..=SLOT_GROUP as u64 {
            t.alloc_one(i).unwrap();
        }
        assert_eq!(t.capacity(), 2 * SLOT_GROUP);
        assert_eq!(t.live_count(), SLOT_GROUP + 1);
    }

    #[test]
    fn lowest_free_slot_is_reused() {
        let mut t = table::<u32>();
        let handles: Vec<_> = (0..5).map(|i| t.alloc_one(i).unwrap()).collect();
        assert_eq!(t.free_one(handles[3]), Some(3));
        assert_eq!(t.free_one(handles[1]), Some(1));
        assert_eq!(t.alloc_one(10).unwrap().index(), 1);
        assert_eq!(t.alloc_one(11).unwrap().index(), 3);
        assert!(t.free_one(handles[1]).is_some());
        assert_eq!(t.free_one(handles[1]), None, "double free is refused");
    }

    #[test]
    fn run_allocation_is_contiguous_and_grows_past_count() {
        let mut t = table::<u16>();
        t.alloc_one(0).unwrap();
        let base = t.alloc_run(40, |i| i as u16).unwrap();
        assert_eq!(base.index(), 1);
        assert!(t.capacity() >= 41 + 1);
        for i in 0..40 {
            assert_eq!(t.get(SlotHandle::from_index(1 + i)), Some(&(i as u16)));
        }
        assert_eq!(t.alloc_run(0, |_| 0), Err(PoolError::InvalidConfiguration));
        t.free_run(base, 40).unwrap();
        assert_eq!(t.live_count(), 1);
        assert_eq!(t.free_run(base, 2), Err(PoolError::InvalidHandle));
    }

    #[test]
    fn addresses_are_stable_across_growth() {
        let mut t = table::<[u8; 24]>();
        let h = t.alloc_one([9; 24]).unwrap();
        let before = t.get(h).unwrap() as *const _;
        for _ in 0..200 {
            t.alloc_one([0; 24]).unwrap();
        }
        t.alloc_run(100, |_| [1; 24]).unwrap();
        assert_eq!(t.get(h).unwrap() as *const _, before);
        assert_eq!(t.get(h), Some(&[9; 24]));
    }

    #[test]
    fn walk_sums_in_ascending_order() {
        let mut t = table::<usize>();
        for i in 0..10 {
            t.alloc_one(i).unwrap();
        }
        t.free_one(SlotHandle::from_index(4));
        let mut seen = Vec::new();
        let total = t.walk(2..8, |h, v| {
            seen.push(h.index());
            *v
        });
        assert_eq!(seen, vec![2, 3, 5, 6, 7]);
        assert_eq!(total, 2 + 3 + 5 + 6 + 7);
    }

    #[test]
    fn search_stops_at_first_match() {
        let mut t = table::<i32>();
        for v in [5, -1, 8, -2, 9] {
            t.alloc_one(v).unwrap();
        }
        let mut visited = 0;
        let (h, v) = t
            .search(.., |_, v| {
                visited += 1;
                *v < 0
            })
            .unwrap();
        assert_eq!((h.index(), *v), (1, -1));
        assert_eq!(visited, 2);
        assert!(t.search(2..3, |_, v| *v < 0).is_none());
        let (h, v) = t.search_mut(2.., |_, v| *v < 0).unwrap();
        *v = 100;
        assert_eq!(t.get(h), Some(&100));
    }

    #[test]
    fn gc_drops_trailing_free_groups() {
        let mut t = table::<u64>();
        let handles: Vec<_> = (0..100).map(|i| t.alloc_one(i).unwrap()).collect();
        assert_eq!(t.capacity(), 4 * SLOT_GROUP);
        for h in &handles[40..] {
            t.free_one(*h);
        }
        assert_eq!(t.gc(), Ok(true));
        assert_eq!(t.capacity(), 2 * SLOT_GROUP);
        assert_eq!(t.gc(), Ok(false));
        for (i, h) in handles[..40].iter().enumerate() {
            assert_eq!(t.get(*h), Some(&(i as u64)));
        }
        for h in &handles[..40] {
            t.free_one(*h);
        }
        assert_eq!(t.gc(), Ok(true));
        assert_eq!(t.capacity(), 0);
        assert!(t.alloc_one(1).is_ok());
    }

    #[test]
    fn values_are_dropped_on_free_clear_and_drop() {
        let marker = Rc::new(());
        let mut t = table::<Rc<()>>();
        let h = t.alloc_one(Rc::clone(&marker)).unwrap();
        for _ in 0..3 {
            t.alloc_one(Rc::clone(&marker)).unwrap();
        }
        drop(t.free_one(h));
        assert_eq!(Rc::strong_count(&marker), 4);
        t.clear();
        assert_eq!(Rc::strong_count(&marker), 1);
        t.alloc_one(Rc::clone(&marker)).unwrap();
        drop(t);
        assert_eq!(Rc::strong_count(&marker), 1);
    }

    #[test]
    fn poison_marks_released_slots() {
        let mut t = table::<u32>().with_poison(true);
        let h = t.alloc_one(0x0102_0304).unwrap();
        let ptr = t.get(h).unwrap() as *const u32;
        t.free_one(h);
        // SAFETY: the slot storage stays allocated; it now holds poison bytes.
        let bytes = unsafe { *ptr };
        assert_eq!(bytes, u32::from_ne_bytes([POISON_RELEASED; 4]));
    }

    #[test]
    fn refused_bitmap_leaves_gc_without_effect() {
        let backing = Arc::new(Refusing::default());
        let mut t = SlotTable::<u64>::new(backing.clone());
        let handles: Vec<_> = (0..2 * SLOT_GROUP as u64).map(|i| t.alloc_one(i).unwrap()).collect();
        for h in &handles[SLOT_GROUP..] {
            t.free_one(*h);
        }

        backing.allocate.store(true, Ordering::Relaxed);
        assert_eq!(t.gc(), Err(PoolError::OutOfMemory));
        assert_eq!(t.capacity(), 2 * SLOT_GROUP);
        assert_eq!(t.live_count(), SLOT_GROUP);
        backing.allocate.store(false, Ordering::Relaxed);

        let h = t.alloc_one(99).unwrap();
        assert_eq!(h.index(), SLOT_GROUP);
        assert_eq!(t.get(h), Some(&99));
        for (i, h) in handles[..SLOT_GROUP].iter().enumerate() {
            assert_eq!(t.get(*h), Some(&(i as u64)));
        }
        t.free_one(h);
        assert_eq!(t.gc(), Ok(true));
        assert_eq!(t.capacity(), SLOT_GROUP);
    }

    #[test]
    fn refused_segment_shrink_leaves_gc_without_effect() {
        let backing = Arc::new(Refusing::default());
        let mut t = SlotTable::<u64>::new(backing.clone());
        // One segment of 128 slots.
        t.alloc_run(100, |i| i as u64).unwrap();
        assert_eq!(t.capacity(), 4 * SLOT_GROUP);
        for index in SLOT_GROUP..100 {
            t.free_one(SlotHandle::from_index(index));
        }

        backing.reallocate.store(true, Ordering::Relaxed);
        assert_eq!(t.gc(), Err(PoolError::OutOfMemory));
        assert_eq!(t.capacity(), 4 * SLOT_GROUP);

        // Every slot of the untouched segment is still usable.
        for value in 0..(3 * SLOT_GROUP) as u64 {
            let h = t.alloc_one(1000 + value).unwrap();
            assert_eq!(t.get(h), Some(&(1000 + value)));
        }
        assert_eq!(t.live_count(), 4 * SLOT_GROUP);
        for index in 0..SLOT_GROUP {
            assert_eq!(t.get(SlotHandle::from_index(index)), Some(&(index as u64)));
        }

        backing.reallocate.store(false, Ordering::Relaxed);
        for index in 2 * SLOT_GROUP..4 * SLOT_GROUP {
            t.free_one(SlotHandle::from_index(index));
        }
        assert_eq!(t.gc(), Ok(true));
        assert_eq!(t.capacity(), 2 * SLOT_GROUP);
        assert_eq!(t.get(SlotHandle::from_index(SLOT_GROUP)), Some(&1000));
    }

    #[test]
    fn growth_and_gc_are_logged() {
        let log = Arc::new(LifecycleLog::with_threshold(Some(LogLevel::Debug), 64));
        let mut t = table::<u32>().with_log(Arc::clone(&log));
        let handles: Vec<_> = (0..40).map(|i| t.alloc_one(i).unwrap()).collect();
        for h in &handles[SLOT_GROUP..] {
            t.free_one(*h);
        }
        assert_eq!(t.gc(), Ok(true));

        let records = log.records();
        assert!(records.iter().all(|r| r.component == Component::SlotTable));
        let events: Vec<_> = records.iter().map(|r| (r.event, r.outcome)).collect();
        assert_eq!(events, vec![("grow", "ok"), ("grow", "ok"), ("gc", "shrunk")]);
        assert!(records[2].details.contains("capacity=32"), "{}", records[2].details);
    }
}
