//! Top-level allocator context.
//!
//! Holds the registries explicitly instead of in process globals, so
//! independent contexts (for tests, or per subsystem) never share pool
//! tables. Only the backing allocator is process-wide.

use std::sync::Arc;

use crate::backing::{self, BackingAllocator};
use crate::config::{PoolDescriptor, PoolOptions};
use crate::error::Result;
use crate::lifecycle::LifecycleLog;
use crate::pool::registry::FixedPoolRegistry;
use crate::pool::size_class::DEFAULT_SIZE_CLASSES;
use crate::pool::variable::VariablePoolRegistry;
use crate::pool::VariablePoolHandle;
use crate::slot_table::SlotTable;

pub struct Allocator {
    backing: Arc<dyn BackingAllocator>,
    log: Arc<LifecycleLog>,
    fixed: Arc<FixedPoolRegistry>,
    variable: VariablePoolRegistry,
}

impl Allocator {
    /// Context over the process-wide backing allocator: the installed
    /// arena if any, the host allocator otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backing(backing::active())
    }

    #[must_use]
    pub fn with_backing(backing: Arc<dyn BackingAllocator>) -> Self {
        Self::with_backing_and_log(backing, Arc::new(LifecycleLog::new()))
    }

    #[must_use]
    pub fn with_backing_and_log(backing: Arc<dyn BackingAllocator>, log: Arc<LifecycleLog>) -> Self {
        let fixed = Arc::new(FixedPoolRegistry::new(Arc::clone(&backing), Arc::clone(&log)));
        let variable = VariablePoolRegistry::new(Arc::clone(&fixed));
        Self {
            backing,
            log,
            fixed,
            variable,
        }
    }

    #[must_use]
    pub fn fixed(&self) -> &FixedPoolRegistry {
        &self.fixed
    }

    #[must_use]
    pub fn variable(&self) -> &VariablePoolRegistry {
        &self.variable
    }

    #[must_use]
    pub fn log(&self) -> &Arc<LifecycleLog> {
        &self.log
    }

    #[must_use]
    pub fn backing(&self) -> &Arc<dyn BackingAllocator> {
        &self.backing
    }

    /// Variable pool over [`DEFAULT_SIZE_CLASSES`].
    pub fn variable_pool_with_defaults(
        &self,
        options: PoolOptions,
        descriptor: PoolDescriptor,
    ) -> Result<VariablePoolHandle> {
        self.variable.init(&DEFAULT_SIZE_CLASSES, options, descriptor)
    }

    /// Empty slot table drawing from this context's backing allocator and
    /// logging to its lifecycle log.
    #[must_use]
    pub fn slot_table<T>(&self) -> SlotTable<T> {
        SlotTable::new(Arc::clone(&self.backing)).with_log(Arc::clone(&self.log))
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("backing", &self.backing.name())
            .field("fixed", &self.fixed)
            .field("variable", &self.variable)
            .finish()
    }
}
