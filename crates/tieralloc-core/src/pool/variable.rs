//! Variable-size pools.
//!
//! A request goes to the first size class whose capacity strictly
//! exceeds the requested size plus the block header; anything larger
//! becomes an overflow object: a payload extent straight from the
//! backing allocator, tracked by a record (itself popped from a small
//! fixed pool) on a doubly-linked list.
//!
//! Every object is preceded by a `BlockHeader`. Pointers handed back
//! to `push`/`resize` are checked against live overflow payloads and
//! the size classes' slabs before any header is read.

#![allow(unsafe_code)]

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;

use super::fixed::FixedPoolStats;
use super::registry::FixedPoolRegistry;
use super::size_class::{self, SizeClassSpec};
use super::{FixedPoolHandle, GcOutcome, ObjectState, VariablePoolHandle};
use crate::backing::{BackingAllocator, Extent};
use crate::config::{OVERFLOW_RECORD_POWER, PoolDescriptor, PoolOptions};
use crate::error::{PoolError, Result};
use crate::lifecycle::{Component, LifecycleLog, LogLevel, Subject};
use crate::slot_table::SlotTable;

/// Header class value marking an overflow object.
const OVERFLOW: usize = usize::MAX;

/// Released overflow addresses remembered for double-push detection.
const RELEASED_MEMORY: usize = 4096;

#[repr(C)]
struct BlockHeader {
    /// Size-class index, or `OVERFLOW`.
    class: usize,
    /// Owning record for overflow objects, null otherwise.
    record: *mut OverflowRecord,
}

/// Bytes in front of every object.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

struct OverflowRecord {
    prev: *mut OverflowRecord,
    next: *mut OverflowRecord,
    size: usize,
    payload: Extent,
}

struct SizeClass {
    capacity: usize,
    pool: FixedPoolHandle,
}

struct OverflowState {
    head: *mut OverflowRecord,
    count: usize,
    bytes: usize,
    /// User addresses of live overflow objects.
    live: HashSet<usize>,
    /// User addresses of recently released overflow objects.
    released: HashSet<usize>,
    last_error: Option<PoolError>,
}

// SAFETY: the records reachable from `head` are owned exclusively by the
// pool and only touched under its lock.
unsafe impl Send for OverflowState {}

impl OverflowState {
    /// Unlinks every record and frees its payload. The record slots are
    /// left to the caller's overflow fixed pool.
    fn drain(&mut self) {
        let mut cursor = self.head;
        while !cursor.is_null() {
            // SAFETY: list records are initialized and owned by this pool;
            // each is read out exactly once.
            let record = unsafe { cursor.read() };
            cursor = record.next;
            drop(record.payload);
        }
        self.head = ptr::null_mut();
        self.count = 0;
        self.bytes = 0;
        self.live.clear();
        self.released.clear();
    }

    fn remember_released(&mut self, addr: usize) {
        if self.released.len() >= RELEASED_MEMORY {
            self.released.clear();
        }
        self.released.insert(addr);
    }
}

/// Per-class slice of [`VariablePoolStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizeClassStats {
    pub capacity: usize,
    pub pool: FixedPoolStats,
}

/// Point-in-time variable pool occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariablePoolStats {
    pub classes: Vec<SizeClassStats>,
    pub overflow_objects: usize,
    pub overflow_bytes: usize,
}

/// Size-classed pool with an overflow list.
pub struct VariablePool {
    id: usize,
    classes: Vec<SizeClass>,
    overflow_records: FixedPoolHandle,
    options: PoolOptions,
    descriptor: PoolDescriptor,
    fixed: Arc<FixedPoolRegistry>,
    backing: Arc<dyn BackingAllocator>,
    log: Arc<LifecycleLog>,
    state: Mutex<OverflowState>,
}

fn user_ptr(block: NonNull<u8>) -> NonNull<u8> {
    // SAFETY: every block is at least HEADER_SIZE bytes plus its payload.
    unsafe { block.add(HEADER_SIZE) }
}

impl VariablePool {
    fn lock(&self) -> Result<MutexGuard<'_, OverflowState>> {
        if self.options.thread_protection {
            Ok(self.state.lock())
        } else {
            self.state.try_lock().ok_or(PoolError::Contended)
        }
    }

    fn fail<T>(&self, state: &mut OverflowState, event: &'static str, subject: Subject, err: PoolError) -> Result<T> {
        state.last_error = Some(err);
        self.log.record(
            LogLevel::Warn,
            Component::Variable,
            event,
            subject,
            err.code(),
            || format!("pool={}", self.descriptor.name()),
        );
        Err(err)
    }

    #[must_use]
    pub fn class_capacities(&self) -> Vec<usize> {
        self.classes.iter().map(|class| class.capacity).collect()
    }

    #[must_use]
    pub fn descriptor(&self) -> &PoolDescriptor {
        &self.descriptor
    }

    /// Index of the first class that serves `size` bytes.
    fn route(&self, size: usize) -> Option<usize> {
        let adjusted = size.checked_add(HEADER_SIZE)?;
        self.classes.iter().position(|class| class.capacity > adjusted)
    }

    /// Class index and object state of the block whose user pointer is `addr`.
    fn locate_class(&self, addr: usize) -> Result<Option<(usize, ObjectState)>> {
        let Some(block) = addr.checked_sub(HEADER_SIZE) else {
            return Ok(None);
        };
        for (index, class) in self.classes.iter().enumerate() {
            match self.fixed.object_state(class.pool, block)? {
                ObjectState::NotOwned => {}
                found => return Ok(Some((index, found))),
            }
        }
        Ok(None)
    }

    pub fn pop(&self, size: usize) -> Result<NonNull<u8>> {
        let mut guard = self.lock()?;
        self.pop_locked(&mut guard, size)
    }

    fn pop_locked(&self, state: &mut OverflowState, size: usize) -> Result<NonNull<u8>> {
        let Some(index) = self.route(size) else {
            return self.pop_overflow(state, size);
        };
        let block = match self.fixed.pop(self.classes[index].pool) {
            Ok(block) => block,
            Err(err) => return self.fail(state, "pop", Subject::pool(self.id).with_size(size), err),
        };
        // SAFETY: block is a fresh object of capacity + HEADER_SIZE bytes,
        // pointer-aligned.
        unsafe {
            block.cast::<BlockHeader>().write(BlockHeader {
                class: index,
                record: ptr::null_mut(),
            });
        }
        Ok(user_ptr(block))
    }

    fn pop_overflow(&self, state: &mut OverflowState, size: usize) -> Result<NonNull<u8>> {
        let subject = Subject::pool(self.id).with_size(size);
        let Some(total) = size.checked_add(HEADER_SIZE) else {
            return self.fail(state, "pop", subject, PoolError::NoMoreMemory);
        };
        let record = match self.fixed.pop(self.overflow_records) {
            Ok(record) => record.cast::<OverflowRecord>(),
            Err(err) => return self.fail(state, "pop", subject, err),
        };
        let Some(payload) = Extent::allocate(&self.backing, total) else {
            // The record slot was never initialized; hand it straight back.
            if let Err(err) = self.fixed.push(self.overflow_records, record.cast()) {
                return self.fail(state, "pop", subject, err);
            }
            return self.fail(state, "pop", subject, PoolError::NoMoreMemory);
        };

        let block = payload.as_ptr();
        // SAFETY: payload holds total >= HEADER_SIZE bytes, 16-aligned; record
        // is a fresh slot sized and aligned for OverflowRecord; the list head
        // is a live record or null.
        unsafe {
            block.cast::<BlockHeader>().write(BlockHeader {
                class: OVERFLOW,
                record: record.as_ptr(),
            });
            record.as_ptr().write(OverflowRecord {
                prev: ptr::null_mut(),
                next: state.head,
                size,
                payload,
            });
            if let Some(head) = state.head.as_mut() {
                head.prev = record.as_ptr();
            }
        }
        state.head = record.as_ptr();
        state.count += 1;
        state.bytes += size;

        let user = user_ptr(block);
        let addr = user.as_ptr() as usize;
        state.live.insert(addr);
        state.released.remove(&addr);
        self.log.record(
            LogLevel::Debug,
            Component::Variable,
            "overflow_alloc",
            subject.with_ptr(addr),
            "ok",
            || format!("overflow_objects={}", state.count),
        );
        Ok(user)
    }

    /// Record behind a live overflow object.
    ///
    /// # Safety
    ///
    /// `user` must be in the pool's `live` overflow set.
    unsafe fn overflow_record(user: NonNull<u8>) -> *mut OverflowRecord {
        // SAFETY: live overflow objects are preceded by their header.
        let header = unsafe { user.cast::<BlockHeader>().sub(1).read() };
        debug_assert_eq!(header.class, OVERFLOW);
        header.record
    }

    pub fn push(&self, object: NonNull<u8>) -> Result<()> {
        let mut guard = self.lock()?;
        self.push_locked(&mut guard, object)
    }

    fn push_locked(&self, state: &mut OverflowState, object: NonNull<u8>) -> Result<()> {
        let addr = object.as_ptr() as usize;
        let subject = Subject::pool(self.id).with_ptr(addr);
        if state.live.contains(&addr) {
            return self.release_overflow(state, object);
        }
        match self.locate_class(addr)? {
            Some((index, ObjectState::Live)) => {
                let block = object.as_ptr().wrapping_sub(HEADER_SIZE);
                let block = NonNull::new(block).ok_or(PoolError::AddressNotOwned)?;
                // SAFETY: a live class object keeps the header stamped at pop.
                debug_assert_eq!(unsafe { block.cast::<BlockHeader>().read().class }, index);
                self.fixed
                    .push(self.classes[index].pool, block)
                    .or_else(|err| self.fail(state, "push", subject, err))
            }
            Some((_, _)) => self.fail(state, "push", subject, PoolError::DoublePush),
            None if state.released.contains(&addr) => self.fail(state, "push", subject, PoolError::DoublePush),
            None => self.fail(state, "push", subject, PoolError::AddressNotOwned),
        }
    }

    fn release_overflow(&self, state: &mut OverflowState, object: NonNull<u8>) -> Result<()> {
        let addr = object.as_ptr() as usize;
        // SAFETY: the caller found `object` in the live overflow set.
        let record = unsafe { Self::overflow_record(object) };
        // SAFETY: record is a live list member; it is read out once and its
        // neighbors are live records or null.
        let size = unsafe {
            let OverflowRecord {
                prev,
                next,
                size,
                payload,
            } = record.read();
            match prev.as_mut() {
                Some(prev) => prev.next = next,
                None => state.head = next,
            }
            if let Some(next) = next.as_mut() {
                next.prev = prev;
            }
            drop(payload);
            size
        };
        state.count -= 1;
        state.bytes -= size;
        state.live.remove(&addr);
        state.remember_released(addr);
        let slot = NonNull::new(record).ok_or(PoolError::AddressNotOwned)?;
        self.fixed.push(self.overflow_records, slot.cast())?;
        self.log.record(
            LogLevel::Debug,
            Component::Variable,
            "overflow_release",
            Subject::pool(self.id).with_ptr(addr).with_size(size),
            "ok",
            String::new,
        );
        Ok(())
    }

    /// Resizes an object. `None` pops. Overflow objects are reallocated in
    /// place when the backing allocator allows it; a sized object whose
    /// class already holds `new_size` bytes is returned unchanged.
    /// Otherwise a new object is popped, the old bytes copied and the old
    /// object pushed.
    pub fn resize(&self, object: Option<NonNull<u8>>, new_size: usize) -> Result<NonNull<u8>> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let Some(object) = object else {
            return self.pop_locked(state, new_size);
        };
        let addr = object.as_ptr() as usize;
        let subject = Subject::pool(self.id).with_ptr(addr).with_size(new_size);

        let old_size = if state.live.contains(&addr) {
            // SAFETY: `object` is a live overflow object, so its record is a
            // live list member owned by this pool.
            let record = unsafe { &mut *Self::overflow_record(object) };
            let old_size = record.size;
            if let Some(total) = new_size.checked_add(HEADER_SIZE) {
                if record.payload.resize(total) {
                    record.size = new_size;
                    state.bytes = state.bytes - old_size + new_size;
                    let moved = user_ptr(record.payload.as_ptr());
                    let moved_addr = moved.as_ptr() as usize;
                    if moved_addr != addr {
                        state.live.remove(&addr);
                        state.live.insert(moved_addr);
                    }
                    return Ok(moved);
                }
            }
            old_size
        } else {
            match self.locate_class(addr)? {
                Some((index, ObjectState::Live)) => {
                    let capacity = self.classes[index].capacity;
                    if capacity >= new_size {
                        return Ok(object);
                    }
                    capacity
                }
                _ => return self.fail(state, "resize", subject, PoolError::AddressNotOwned),
            }
        };

        let fresh = self.pop_locked(state, new_size)?;
        // SAFETY: both objects are live, distinct, and hold at least the
        // copied number of bytes.
        unsafe {
            ptr::copy_nonoverlapping(object.as_ptr(), fresh.as_ptr(), old_size.min(new_size));
        }
        self.push_locked(state, object)?;
        Ok(fresh)
    }

    /// Releases every object of every class plus the overflow list. A
    /// class that cannot be reset does not stop the others; the first
    /// error is returned once everything else is released.
    pub fn free_all(&self) -> Result<()> {
        let mut guard = self.lock()?;
        let mut first_err = None;
        for class in &self.classes {
            if let Err(err) = self.fixed.free_all(class.pool) {
                first_err.get_or_insert(err);
            }
        }
        // The record pool is only reached under this pool's lock, so the
        // list and its records are released together.
        guard.drain();
        self.fixed.free_all(self.overflow_records)?;
        match first_err {
            Some(err) => self.fail(&mut guard, "free_all", Subject::pool(self.id), err),
            None => Ok(()),
        }
    }

    /// Garbage-collects every class pool and the overflow-record pool.
    pub fn gc(&self) -> Result<GcOutcome> {
        let mut guard = self.lock()?;
        let mut reclaimed = 0;
        for pool in self.classes.iter().map(|class| class.pool).chain([self.overflow_records]) {
            reclaimed += self.fixed.gc(pool)?.reclaimed();
        }
        if reclaimed == 0 {
            guard.last_error = Some(PoolError::NoEmptyRegion);
            return Ok(GcOutcome::NothingToReclaim);
        }
        Ok(GcOutcome::Reclaimed { slabs: reclaimed })
    }

    /// Visits every live object: size classes in ascending order, then
    /// overflow objects from the most recent. Stops at the first `Break`.
    pub fn walk<B>(&self, mut visitor: impl FnMut(NonNull<u8>) -> ControlFlow<B>) -> Result<ControlFlow<B>> {
        let guard = self.lock()?;
        for class in &self.classes {
            if let ControlFlow::Break(value) = self.fixed.walk(class.pool, |block| visitor(user_ptr(block)))? {
                return Ok(ControlFlow::Break(value));
            }
        }
        let mut cursor = guard.head;
        while !cursor.is_null() {
            // SAFETY: list records are live while the pool lock is held.
            let (next, block) = unsafe { ((*cursor).next, (*cursor).payload.as_ptr()) };
            if let ControlFlow::Break(value) = visitor(user_ptr(block)) {
                return Ok(ControlFlow::Break(value));
            }
            cursor = next;
        }
        Ok(ControlFlow::Continue(()))
    }

    pub fn last_error(&self) -> Result<Option<PoolError>> {
        Ok(self.lock()?.last_error)
    }

    pub fn stats(&self) -> Result<VariablePoolStats> {
        let guard = self.lock()?;
        let classes = self
            .classes
            .iter()
            .map(|class| -> Result<SizeClassStats> {
                Ok(SizeClassStats {
                    capacity: class.capacity,
                    pool: self.fixed.stats(class.pool)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(VariablePoolStats {
            classes,
            overflow_objects: guard.count,
            overflow_bytes: guard.bytes,
        })
    }
}

impl Drop for VariablePool {
    fn drop(&mut self) {
        self.state.get_mut().drain();
        for pool in self.classes.iter().map(|class| class.pool).chain([self.overflow_records]) {
            // Already-cleaned class pools are the only possible failure.
            let _ = self.fixed.clean(pool);
        }
    }
}

impl std::fmt::Debug for VariablePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariablePool")
            .field("id", &self.id)
            .field("name", &self.descriptor.name())
            .field("classes", &self.class_capacities())
            .field("options", &self.options)
            .finish()
    }
}

/// Registry of variable pools, sharing one [`FixedPoolRegistry`] for
/// their size classes.
pub struct VariablePoolRegistry {
    fixed: Arc<FixedPoolRegistry>,
    log: Arc<LifecycleLog>,
    pools: RwLock<SlotTable<VariablePool>>,
}

impl VariablePoolRegistry {
    #[must_use]
    pub fn new(fixed: Arc<FixedPoolRegistry>) -> Self {
        let log = Arc::clone(fixed.log());
        let pools = RwLock::new(SlotTable::new(Arc::clone(fixed.backing())).with_log(Arc::clone(&log)));
        Self { fixed, log, pools }
    }

    #[must_use]
    pub fn fixed(&self) -> &Arc<FixedPoolRegistry> {
        &self.fixed
    }

    /// Creates one fixed pool per class (object size = capacity + header)
    /// plus the overflow-record pool.
    pub fn init(
        &self,
        classes: &[SizeClassSpec],
        options: PoolOptions,
        descriptor: PoolDescriptor,
    ) -> Result<VariablePoolHandle> {
        if let Err(err) = size_class::validate(classes) {
            self.log.record(
                LogLevel::Warn,
                Component::Variable,
                "init",
                Subject::none(),
                err.code(),
                || format!("name={} classes={classes:?}", descriptor.name()),
            );
            return Err(err);
        }

        let mut created = Vec::with_capacity(classes.len());
        let overflow_records = match self.create_fixed_pools(classes, options, &descriptor, &mut created) {
            Ok(handle) => handle,
            Err(err) => {
                for class in &created {
                    let _ = self.fixed.clean(class.pool);
                }
                return Err(err);
            }
        };

        let name = descriptor.name().to_owned();
        let pool = VariablePool {
            id: 0,
            classes: created,
            overflow_records,
            options,
            descriptor,
            fixed: Arc::clone(&self.fixed),
            backing: Arc::clone(self.fixed.backing()),
            log: Arc::clone(&self.log),
            state: Mutex::new(OverflowState {
                head: ptr::null_mut(),
                count: 0,
                bytes: 0,
                live: HashSet::new(),
                released: HashSet::new(),
                last_error: None,
            }),
        };
        let mut pools = self.pools.write();
        let handle = pools.alloc_one(pool)?;
        if let Some(pool) = pools.get_mut(handle) {
            pool.id = handle.index();
        }
        drop(pools);
        self.log.record(
            LogLevel::Info,
            Component::Variable,
            "init",
            Subject::pool(handle.index()),
            "ok",
            || format!("name={name} classes={}", classes.len()),
        );
        Ok(VariablePoolHandle(handle))
    }

    /// Pushes one class per table entry into `created`, then returns the
    /// overflow-record pool. On error the caller cleans what was created.
    fn create_fixed_pools(
        &self,
        classes: &[SizeClassSpec],
        options: PoolOptions,
        descriptor: &PoolDescriptor,
        created: &mut Vec<SizeClass>,
    ) -> Result<FixedPoolHandle> {
        for spec in classes {
            let object_size = spec
                .capacity
                .checked_add(HEADER_SIZE)
                .ok_or(PoolError::InvalidConfiguration)?;
            let pool = self.fixed.init(
                object_size,
                spec.capacity_power,
                options,
                PoolDescriptor::named(format!("{}/{}", descriptor.name(), spec.capacity)),
            )?;
            created.push(SizeClass {
                capacity: spec.capacity,
                pool,
            });
        }
        self.fixed.init(
            size_of::<OverflowRecord>(),
            OVERFLOW_RECORD_POWER,
            options,
            PoolDescriptor::named(format!("{}/overflow", descriptor.name())),
        )
    }

    fn with_pool<R>(&self, handle: VariablePoolHandle, f: impl FnOnce(&VariablePool) -> Result<R>) -> Result<R> {
        let pools = self.pools.read();
        let pool = pools.get(handle.0).ok_or(PoolError::InvalidHandle)?;
        f(pool)
    }

    pub fn pop(&self, handle: VariablePoolHandle, size: usize) -> Result<NonNull<u8>> {
        self.with_pool(handle, |pool| pool.pop(size))
    }

    pub fn push(&self, handle: VariablePoolHandle, object: NonNull<u8>) -> Result<()> {
        self.with_pool(handle, |pool| pool.push(object))
    }

    pub fn resize(
        &self,
        handle: VariablePoolHandle,
        object: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<NonNull<u8>> {
        self.with_pool(handle, |pool| pool.resize(object, new_size))
    }

    pub fn free_all(&self, handle: VariablePoolHandle) -> Result<()> {
        self.with_pool(handle, VariablePool::free_all)
    }

    pub fn gc(&self, handle: VariablePoolHandle) -> Result<GcOutcome> {
        self.with_pool(handle, VariablePool::gc)
    }

    /// See [`VariablePool::walk`]; the visitor must not call back into
    /// this pool.
    pub fn walk<B>(
        &self,
        handle: VariablePoolHandle,
        visitor: impl FnMut(NonNull<u8>) -> ControlFlow<B>,
    ) -> Result<ControlFlow<B>> {
        self.with_pool(handle, |pool| pool.walk(visitor))
    }

    pub fn last_error(&self, handle: VariablePoolHandle) -> Result<Option<PoolError>> {
        self.with_pool(handle, VariablePool::last_error)
    }

    pub fn stats(&self, handle: VariablePoolHandle) -> Result<VariablePoolStats> {
        self.with_pool(handle, VariablePool::stats)
    }

    pub fn descriptor(&self, handle: VariablePoolHandle) -> Result<PoolDescriptor> {
        self.with_pool(handle, |pool| Ok(pool.descriptor().clone()))
    }

    pub fn class_capacities(&self, handle: VariablePoolHandle) -> Result<Vec<usize>> {
        self.with_pool(handle, |pool| Ok(pool.class_capacities()))
    }

    /// Releases everything the pool holds, including its class pools, and
    /// retires the handle.
    pub fn clean(&self, handle: VariablePoolHandle) -> Result<()> {
        let pool = self
            .pools
            .write()
            .free_one(handle.0)
            .ok_or(PoolError::InvalidHandle)?;
        drop(pool);
        self.log.record(
            LogLevel::Info,
            Component::Variable,
            "clean",
            Subject::pool(handle.index()),
            "ok",
            String::new,
        );
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.read().live_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for VariablePoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariablePoolRegistry")
            .field("pools", &self.len())
            .finish()
    }
}
