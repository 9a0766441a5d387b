//! Slab pools.
//!
//! - [`fixed`]: one object size, growable set of slabs.
//! - [`registry`]: handle-addressed table of fixed pools.
//! - [`variable`]: size classes over fixed pools plus an overflow list.

pub mod fixed;
pub mod registry;
pub mod size_class;
pub mod variable;

use serde::Serialize;

use crate::slot_table::SlotHandle;

/// Result of a garbage-collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GcOutcome {
    /// Fully free slabs were returned to the backing allocator.
    Reclaimed { slabs: usize },
    /// Every slab still holds a live object. Not a failure; the pool's
    /// last error is set to [`NoEmptyRegion`](crate::PoolError::NoEmptyRegion).
    NothingToReclaim,
}

impl GcOutcome {
    #[must_use]
    pub const fn reclaimed(self) -> usize {
        match self {
            Self::Reclaimed { slabs } => slabs,
            Self::NothingToReclaim => 0,
        }
    }
}

/// Whether an address is a live object of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Outside every slab, or not at an object boundary.
    NotOwned,
    Free,
    Live,
}

/// Handle of a fixed pool in a [`FixedPoolRegistry`](registry::FixedPoolRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FixedPoolHandle(pub(crate) SlotHandle);

/// Handle of a variable pool in a [`VariablePoolRegistry`](variable::VariablePoolRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct VariablePoolHandle(pub(crate) SlotHandle);

macro_rules! handle_accessors {
    ($($handle:ident),*) => {$(
        impl $handle {
            #[must_use]
            pub const fn index(self) -> usize {
                self.0.index()
            }

            /// Rebuilds a handle from its index. Unknown indices are
            /// rejected by the registry with `InvalidHandle`.
            #[must_use]
            pub const fn from_index(index: usize) -> Self {
                Self(SlotHandle::from_index(index))
            }
        }
    )*};
}

handle_accessors!(FixedPoolHandle, VariablePoolHandle);
