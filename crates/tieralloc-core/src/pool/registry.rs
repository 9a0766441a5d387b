//! Handle-addressed table of fixed pools.

use std::ops::ControlFlow;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::RwLock;

use super::fixed::{FixedPool, FixedPoolStats};
use super::{FixedPoolHandle, GcOutcome, ObjectState};
use crate::backing::BackingAllocator;
use crate::config::{PoolDescriptor, PoolOptions};
use crate::error::{PoolError, Result};
use crate::lifecycle::{Component, LifecycleLog, LogLevel, Subject};
use crate::slot_table::SlotTable;

/// Registry of fixed pools. Pool records live in a [`SlotTable`], so
/// creating more pools never invalidates an existing handle.
///
/// Per-pool operations take the registry read lock plus the pool's own
/// lock; `init` and `clean` take the write lock.
pub struct FixedPoolRegistry {
    backing: Arc<dyn BackingAllocator>,
    log: Arc<LifecycleLog>,
    pools: RwLock<SlotTable<FixedPool>>,
}

impl FixedPoolRegistry {
    #[must_use]
    pub fn new(backing: Arc<dyn BackingAllocator>, log: Arc<LifecycleLog>) -> Self {
        let pools = RwLock::new(SlotTable::new(Arc::clone(&backing)).with_log(Arc::clone(&log)));
        Self { backing, log, pools }
    }

    #[must_use]
    pub fn backing(&self) -> &Arc<dyn BackingAllocator> {
        &self.backing
    }

    #[must_use]
    pub fn log(&self) -> &Arc<LifecycleLog> {
        &self.log
    }

    /// Creates a pool of `object_size`-byte objects with
    /// `2^capacity_power` objects per slab.
    pub fn init(
        &self,
        object_size: usize,
        capacity_power: u32,
        options: PoolOptions,
        descriptor: PoolDescriptor,
    ) -> Result<FixedPoolHandle> {
        let name = descriptor.name().to_owned();
        let pool = match FixedPool::new(
            object_size,
            capacity_power,
            options,
            descriptor,
            Arc::clone(&self.backing),
            Arc::clone(&self.log),
        ) {
            Ok(pool) => pool,
            Err(err) => {
                self.log.record(
                    LogLevel::Warn,
                    Component::Fixed,
                    "init",
                    Subject::none().with_size(object_size),
                    err.code(),
                    || format!("name={name} capacity_power={capacity_power}"),
                );
                return Err(err);
            }
        };

        let mut pools = self.pools.write();
        let handle = pools.alloc_one(pool)?;
        if let Some(pool) = pools.get_mut(handle) {
            pool.id = handle.index();
        }
        drop(pools);
        self.log.record(
            LogLevel::Info,
            Component::Fixed,
            "init",
            Subject::pool(handle.index()).with_size(object_size),
            "ok",
            || format!("name={name} capacity_power={capacity_power} options={options:?}"),
        );
        Ok(FixedPoolHandle(handle))
    }

    fn with_pool<R>(&self, handle: FixedPoolHandle, f: impl FnOnce(&FixedPool) -> Result<R>) -> Result<R> {
        let pools = self.pools.read();
        let pool = pools.get(handle.0).ok_or(PoolError::InvalidHandle)?;
        f(pool)
    }

    pub fn pop(&self, handle: FixedPoolHandle) -> Result<NonNull<u8>> {
        self.with_pool(handle, FixedPool::pop)
    }

    pub fn push(&self, handle: FixedPoolHandle, object: NonNull<u8>) -> Result<()> {
        self.with_pool(handle, |pool| pool.push(object))
    }

    pub fn free_all(&self, handle: FixedPoolHandle) -> Result<()> {
        self.with_pool(handle, FixedPool::free_all)
    }

    pub fn gc(&self, handle: FixedPoolHandle) -> Result<GcOutcome> {
        self.with_pool(handle, FixedPool::gc)
    }

    /// Garbage-collects every pool; returns the number of slabs reclaimed.
    pub fn gc_all(&self) -> Result<usize> {
        let pools = self.pools.read();
        let mut reclaimed = 0;
        for (_, pool) in pools.iter() {
            reclaimed += pool.gc()?.reclaimed();
        }
        Ok(reclaimed)
    }

    /// See [`FixedPool::walk`]; the visitor must not call back into this
    /// registry's pool.
    pub fn walk<B>(
        &self,
        handle: FixedPoolHandle,
        visitor: impl FnMut(NonNull<u8>) -> ControlFlow<B>,
    ) -> Result<ControlFlow<B>> {
        self.with_pool(handle, |pool| pool.walk(visitor))
    }

    pub fn last_error(&self, handle: FixedPoolHandle) -> Result<Option<PoolError>> {
        self.with_pool(handle, FixedPool::last_error)
    }

    pub fn stats(&self, handle: FixedPoolHandle) -> Result<FixedPoolStats> {
        self.with_pool(handle, FixedPool::stats)
    }

    pub fn descriptor(&self, handle: FixedPoolHandle) -> Result<PoolDescriptor> {
        self.with_pool(handle, |pool| Ok(pool.descriptor().clone()))
    }

    pub fn object_size(&self, handle: FixedPoolHandle) -> Result<usize> {
        self.with_pool(handle, |pool| Ok(pool.object_size()))
    }

    pub fn owns(&self, handle: FixedPoolHandle, addr: usize) -> Result<bool> {
        self.with_pool(handle, |pool| pool.owns(addr))
    }

    pub fn object_state(&self, handle: FixedPoolHandle, addr: usize) -> Result<ObjectState> {
        self.with_pool(handle, |pool| pool.object_state(addr))
    }

    /// Releases every slab of the pool and retires its handle.
    pub fn clean(&self, handle: FixedPoolHandle) -> Result<()> {
        let pool = self
            .pools
            .write()
            .free_one(handle.0)
            .ok_or(PoolError::InvalidHandle)?;
        let name = pool.descriptor().name().to_owned();
        drop(pool);
        self.log.record(
            LogLevel::Info,
            Component::Fixed,
            "clean",
            Subject::pool(handle.index()),
            "ok",
            || format!("name={name}"),
        );
        Ok(())
    }

    /// Number of live pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.read().live_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for FixedPoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedPoolRegistry")
            .field("backing", &self.backing.name())
            .field("pools", &self.len())
            .finish()
    }
}
