//! # tieralloc-core
//!
//! Three-tier memory allocation:
//!
//! - [`arena`]: buddy-style page allocator over one pre-reserved buffer,
//!   installable as the process-wide [`BackingAllocator`].
//! - [`slot_table`]: growable table of fixed-size records addressed by
//!   stable integer handles.
//! - [`pool`]: fixed-size slab pools and size-classed variable pools
//!   with an overflow list, registered behind integer handles.
//!
//! An [`Allocator`] context ties the registries to a backing allocator
//! and a [`LifecycleLog`].
//!
//! Unsafe code is denied crate-wide; only the modules that manage raw
//! memory opt back in.

#![deny(unsafe_code)]

pub mod arena;
pub mod backing;
mod bitmap;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod slot_table;

pub use arena::{Arena, ArenaStats};
pub use backing::{BackingAllocator, Extent, SystemBacking};
pub use config::{PoolDescriptor, PoolOptions};
pub use context::Allocator;
pub use error::{PoolError, Result};
pub use lifecycle::{LifecycleLog, LifecycleRecord, LogLevel};
pub use pool::fixed::{FixedPool, FixedPoolStats};
pub use pool::registry::FixedPoolRegistry;
pub use pool::size_class::{DEFAULT_SIZE_CLASSES, SizeClassSpec};
pub use pool::variable::{HEADER_SIZE, SizeClassStats, VariablePoolRegistry, VariablePoolStats};
pub use pool::{FixedPoolHandle, GcOutcome, ObjectState, VariablePoolHandle};
pub use slot_table::{SlotHandle, SlotTable};
