//! Fixed-size slab pool.
//!
//! Objects of one size live in slabs of `objects_per_slab` slots. Each
//! slab is a slot-table record holding two extents: a `u64` free bitmap
//! and the object storage. Slabs are created on demand and reclaimed by
//! [`FixedPool::gc`] once fully free.

#![allow(unsafe_code)]

use std::ops::ControlFlow;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use super::{GcOutcome, ObjectState};
use crate::backing::{BackingAllocator, Extent};
use crate::bitmap::{BitWord, Bitmap};
use crate::config::{
    BITMAP_WORD_BITS, BITMAP_WORD_POWER, MAX_CAPACITY_POWER, POISON_FRESH_STORAGE, POISON_RELEASED,
    PoolDescriptor, PoolOptions,
};
use crate::error::{PoolError, Result};
use crate::lifecycle::{Component, LifecycleLog, LogLevel, Subject};
use crate::slot_table::{SlotHandle, SlotTable};

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixedPoolStats {
    pub object_size: usize,
    pub objects_per_slab: usize,
    pub slabs: usize,
    pub objects_out: usize,
    pub peak_objects_out: usize,
    pub free_objects: usize,
}

struct Slab {
    bitmap: Bitmap<u64>,
    storage: Extent,
    available: usize,
    /// Lowest bitmap word that may hold a free bit.
    cursor: usize,
}

impl Slab {
    fn create(
        backing: &Arc<dyn BackingAllocator>,
        objects: usize,
        object_size: usize,
        poison: bool,
    ) -> Option<Self> {
        let bitmap = Bitmap::new(backing, objects / BITMAP_WORD_BITS, u64::ALL_FREE)?;
        let mut storage = Extent::allocate(backing, objects * object_size)?;
        if poison {
            storage.fill(0, storage.len(), POISON_FRESH_STORAGE);
        }
        Some(Self {
            bitmap,
            storage,
            available: objects,
            cursor: 0,
        })
    }

    /// Takes the lowest free object; also reports whether the slab is now full.
    fn take(&mut self, object_size: usize) -> Option<(NonNull<u8>, bool)> {
        let bit = self.bitmap.first_free_from(self.cursor)?;
        self.bitmap.mark_used(bit);
        self.available -= 1;
        let words = self.bitmap.words();
        while self.cursor < words.len() && words[self.cursor] == u64::NONE_FREE {
            self.cursor += 1;
        }
        // SAFETY: bit < objects_per_slab, so the object lies inside storage.
        let object = unsafe { self.storage.as_ptr().add(bit * object_size) };
        Some((object, self.available == 0))
    }

    fn release(&mut self, bit: usize, object_size: usize, poison: bool) {
        self.bitmap.mark_free(bit);
        self.available += 1;
        self.cursor = self.cursor.min(bit / BITMAP_WORD_BITS);
        if poison {
            self.storage.fill(bit * object_size, object_size, POISON_RELEASED);
        }
    }

    /// Object index of `addr`, if it is an object boundary inside storage.
    fn object_index(&self, addr: usize, object_size: usize) -> Option<usize> {
        self.storage
            .offset_of(addr)
            .filter(|offset| offset % object_size == 0)
            .map(|offset| offset / object_size)
    }
}

struct PoolState {
    slabs: SlotTable<Slab>,
    /// Lowest slab handle that may have room.
    pool_scan_cursor: usize,
    last_error: Option<PoolError>,
    objects_out: usize,
    peak_objects_out: usize,
}

/// Pool of same-sized objects.
pub struct FixedPool {
    pub(crate) id: usize,
    object_size: usize,
    objects_per_slab: usize,
    options: PoolOptions,
    poison: bool,
    descriptor: PoolDescriptor,
    backing: Arc<dyn BackingAllocator>,
    log: Arc<LifecycleLog>,
    state: Mutex<PoolState>,
}

impl FixedPool {
    /// Creates an empty pool. `object_size` is rounded up to pointer
    /// alignment; slabs hold `2^max(capacity_power, 6)` objects.
    pub fn new(
        object_size: usize,
        capacity_power: u32,
        options: PoolOptions,
        descriptor: PoolDescriptor,
        backing: Arc<dyn BackingAllocator>,
        log: Arc<LifecycleLog>,
    ) -> Result<Self> {
        if object_size == 0 || capacity_power == 0 || capacity_power > MAX_CAPACITY_POWER {
            return Err(PoolError::InvalidConfiguration);
        }
        let object_size = object_size
            .checked_next_multiple_of(align_of::<usize>())
            .ok_or(PoolError::InvalidConfiguration)?;
        let objects_per_slab = 1usize << capacity_power.max(BITMAP_WORD_POWER);
        objects_per_slab
            .checked_mul(object_size)
            .ok_or(PoolError::InvalidConfiguration)?;

        let poison = options.poison_enabled();
        let slabs = SlotTable::new(Arc::clone(&backing))
            .with_poison(poison)
            .with_log(Arc::clone(&log));
        Ok(Self {
            id: 0,
            object_size,
            objects_per_slab,
            options,
            poison,
            descriptor,
            backing,
            log,
            state: Mutex::new(PoolState {
                slabs,
                pool_scan_cursor: 0,
                last_error: None,
                objects_out: 0,
                peak_objects_out: 0,
            }),
        })
    }

    #[must_use]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    #[must_use]
    pub fn objects_per_slab(&self) -> usize {
        self.objects_per_slab
    }

    #[must_use]
    pub fn options(&self) -> PoolOptions {
        self.options
    }

    #[must_use]
    pub fn descriptor(&self) -> &PoolDescriptor {
        &self.descriptor
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState>> {
        if self.options.thread_protection {
            Ok(self.state.lock())
        } else {
            self.state.try_lock().ok_or(PoolError::Contended)
        }
    }

    fn fail<T>(&self, state: &mut PoolState, event: &'static str, subject: Subject, err: PoolError) -> Result<T> {
        state.last_error = Some(err);
        self.log.record(
            LogLevel::Warn,
            Component::Fixed,
            event,
            subject,
            err.code(),
            || format!("pool={} object_size={}", self.descriptor.name(), self.object_size),
        );
        Err(err)
    }

    /// Pops one object: the lowest free slot of the first slab with room,
    /// scanning slab handles upward from the pool cursor. Creates a slab
    /// when none has room.
    pub fn pop(&self) -> Result<NonNull<u8>> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let from = state.pool_scan_cursor;
        let object_size = self.object_size;
        let taken = state
            .slabs
            .search_mut(from.., |_, slab| slab.available > 0)
            .and_then(|(handle, slab)| slab.take(object_size).map(|(object, full)| (handle, object, full)));
        if let Some((handle, object, now_full)) = taken {
            state.pool_scan_cursor = if now_full {
                handle.index() + 1
            } else {
                handle.index()
            };
            note_out(state);
            return Ok(object);
        }

        let Some(slab) = Slab::create(&self.backing, self.objects_per_slab, object_size, self.poison) else {
            return self.fail(state, "pop", Subject::pool(self.id), PoolError::NoMoreMemory);
        };
        let handle = match state.slabs.alloc_one(slab) {
            Ok(handle) => handle,
            Err(_) => return self.fail(state, "pop", Subject::pool(self.id), PoolError::NoMoreMemory),
        };
        let Some((object, _)) = state.slabs.get_mut(handle).and_then(|slab| slab.take(object_size)) else {
            return self.fail(state, "pop", Subject::pool(self.id), PoolError::NoMoreMemory);
        };
        state.pool_scan_cursor = handle.index();
        note_out(state);
        let slabs = state.slabs.live_count();
        self.log.record(
            LogLevel::Debug,
            Component::Fixed,
            "slab_created",
            Subject::pool(self.id)
                .with_ptr(object.as_ptr() as usize)
                .with_size(self.objects_per_slab * object_size),
            "ok",
            || format!("slab={} live_slabs={slabs}", handle.index()),
        );
        Ok(object)
    }

    /// Returns an object to its slab.
    pub fn push(&self, object: NonNull<u8>) -> Result<()> {
        let addr = object.as_ptr() as usize;
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let subject = Subject::pool(self.id).with_ptr(addr);
        let object_size = self.object_size;

        let found = state.slabs.search_mut(.., |_, slab| slab.storage.contains(addr));
        let Some((handle, slab)) = found else {
            return self.fail(state, "push", subject, PoolError::AddressNotOwned);
        };
        let Some(bit) = slab.object_index(addr, object_size) else {
            return self.fail(state, "push", subject, PoolError::AddressNotOwned);
        };
        if slab.bitmap.is_free(bit) {
            return self.fail(state, "push", subject, PoolError::DoublePush);
        }
        slab.release(bit, object_size, self.poison);
        state.pool_scan_cursor = state.pool_scan_cursor.min(handle.index());
        state.objects_out = state.objects_out.saturating_sub(1);
        Ok(())
    }

    /// Whether `addr` is a live object, a free object, or neither.
    pub fn object_state(&self, addr: usize) -> Result<ObjectState> {
        let guard = self.lock()?;
        let object_size = self.object_size;
        Ok(guard
            .slabs
            .search(.., |_, slab| slab.storage.contains(addr))
            .and_then(|(_, slab)| slab.object_index(addr, object_size).map(|bit| (slab, bit)))
            .map_or(ObjectState::NotOwned, |(slab, bit)| {
                if slab.bitmap.is_free(bit) {
                    ObjectState::Free
                } else {
                    ObjectState::Live
                }
            }))
    }

    /// Whether `addr` falls inside any slab's storage.
    pub fn owns(&self, addr: usize) -> Result<bool> {
        let guard = self.lock()?;
        Ok(guard.slabs.iter().any(|(_, slab)| slab.storage.contains(addr)))
    }

    /// Releases every slab, returning the pool to its initial state.
    pub fn free_all(&self) -> Result<()> {
        let mut guard = self.lock()?;
        let slabs = guard.slabs.live_count();
        guard.slabs.clear();
        guard.pool_scan_cursor = 0;
        guard.objects_out = 0;
        drop(guard);
        self.log.record(
            LogLevel::Info,
            Component::Fixed,
            "free_all",
            Subject::pool(self.id),
            "ok",
            || format!("released_slabs={slabs}"),
        );
        Ok(())
    }

    /// Reclaims fully free slabs. Resets the slab directory when every
    /// slab went.
    pub fn gc(&self) -> Result<GcOutcome> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        if state.slabs.is_empty() {
            return Ok(GcOutcome::Reclaimed { slabs: 0 });
        }
        let objects = self.objects_per_slab;
        let empty: Vec<SlotHandle> = state
            .slabs
            .iter()
            .filter(|(_, slab)| slab.available == objects)
            .map(|(handle, _)| handle)
            .collect();
        if empty.is_empty() {
            state.last_error = Some(PoolError::NoEmptyRegion);
            let slabs = state.slabs.live_count();
            self.log.record(
                LogLevel::Debug,
                Component::Fixed,
                "gc",
                Subject::pool(self.id),
                PoolError::NoEmptyRegion.code(),
                || format!("live_slabs={slabs}"),
            );
            return Ok(GcOutcome::NothingToReclaim);
        }

        for handle in &empty {
            drop(state.slabs.free_one(*handle));
        }
        if state.slabs.is_empty() {
            state.slabs.clear();
            state.pool_scan_cursor = 0;
        } else if let Err(err) = state.slabs.gc() {
            return self.fail(state, "gc", Subject::pool(self.id), err);
        }
        let remaining = state.slabs.live_count();
        self.log.record(
            LogLevel::Info,
            Component::Fixed,
            "gc",
            Subject::pool(self.id),
            "reclaimed",
            || format!("reclaimed_slabs={} live_slabs={remaining}", empty.len()),
        );
        Ok(GcOutcome::Reclaimed { slabs: empty.len() })
    }

    /// Visits every live object, slab by slab then slot by slot in
    /// ascending order, stopping at the first `Break`.
    ///
    /// The pool stays locked during the walk; the visitor must not call
    /// back into this pool.
    pub fn walk<B>(&self, mut visitor: impl FnMut(NonNull<u8>) -> ControlFlow<B>) -> Result<ControlFlow<B>> {
        let guard = self.lock()?;
        for (_, slab) in guard.slabs.iter() {
            for (word_index, &word) in slab.bitmap.words().iter().enumerate() {
                let mut used = !word;
                while used != 0 {
                    let bit = word_index * BITMAP_WORD_BITS + used.trailing_zeros() as usize;
                    used &= used - 1;
                    // SAFETY: bit < objects_per_slab, inside the slab storage.
                    let object = unsafe { slab.storage.as_ptr().add(bit * self.object_size) };
                    if let ControlFlow::Break(value) = visitor(object) {
                        return Ok(ControlFlow::Break(value));
                    }
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    pub fn last_error(&self) -> Result<Option<PoolError>> {
        Ok(self.lock()?.last_error)
    }

    pub fn stats(&self) -> Result<FixedPoolStats> {
        let guard = self.lock()?;
        Ok(FixedPoolStats {
            object_size: self.object_size,
            objects_per_slab: self.objects_per_slab,
            slabs: guard.slabs.live_count(),
            objects_out: guard.objects_out,
            peak_objects_out: guard.peak_objects_out,
            free_objects: guard.slabs.iter().map(|(_, slab)| slab.available).sum(),
        })
    }
}

fn note_out(state: &mut PoolState) {
    state.objects_out += 1;
    state.peak_objects_out = state.peak_objects_out.max(state.objects_out);
}

impl std::fmt::Debug for FixedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedPool")
            .field("id", &self.id)
            .field("name", &self.descriptor.name())
            .field("object_size", &self.object_size)
            .field("objects_per_slab", &self.objects_per_slab)
            .field("options", &self.options)
            .finish()
    }
}
