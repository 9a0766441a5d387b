//! Size-class tables for variable pools.

use serde::Serialize;

use crate::config::MAX_CAPACITY_POWER;
use crate::error::{PoolError, Result};

/// One size class: the payload bytes it serves and its slab capacity
/// exponent (a preallocation hint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SizeClassSpec {
    pub capacity: usize,
    pub capacity_power: u32,
}

impl SizeClassSpec {
    #[must_use]
    pub const fn new(capacity: usize, capacity_power: u32) -> Self {
        Self {
            capacity,
            capacity_power,
        }
    }
}

/// Power-of-two classes from 16 to 1024 bytes; larger classes get
/// smaller slabs.
pub const DEFAULT_SIZE_CLASSES: [SizeClassSpec; 7] = [
    SizeClassSpec::new(16, 9),
    SizeClassSpec::new(32, 8),
    SizeClassSpec::new(64, 7),
    SizeClassSpec::new(128, 6),
    SizeClassSpec::new(256, 5),
    SizeClassSpec::new(512, 5),
    SizeClassSpec::new(1024, 5),
];

/// Rejects empty tables, zero capacities or exponents, and capacities
/// that are not strictly ascending.
pub fn validate(classes: &[SizeClassSpec]) -> Result<()> {
    if classes.is_empty() {
        return Err(PoolError::InvalidConfiguration);
    }
    let well_formed = classes
        .iter()
        .all(|c| c.capacity > 0 && c.capacity_power > 0 && c.capacity_power <= MAX_CAPACITY_POWER);
    let ascending = classes.windows(2).all(|w| w[0].capacity < w[1].capacity);
    if well_formed && ascending {
        Ok(())
    } else {
        Err(PoolError::InvalidConfiguration)
    }
}
