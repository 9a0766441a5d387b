//! Error taxonomy shared by every allocator tier.

use serde::Serialize;
use thiserror::Error;

/// Failure kinds reported by arena, slot-table and pool operations.
///
/// Every pool also retains the last value it returned, see
/// [`FixedPoolRegistry::last_error`](crate::FixedPoolRegistry::last_error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolError {
    /// Zero object size, zero or oversized capacity exponent, or a bad
    /// size-class table.
    #[error("invalid pool configuration")]
    InvalidConfiguration,
    /// The backing allocator could not grow a table.
    #[error("backing allocator exhausted")]
    OutOfMemory,
    /// A pool could neither find nor create room for another object.
    #[error("no more memory available for this pool")]
    NoMoreMemory,
    /// The pointer was never issued by this pool.
    #[error("address not owned by this pool")]
    AddressNotOwned,
    /// The object is already free.
    #[error("object pushed twice without an intervening pop")]
    DoublePush,
    /// Garbage collection found nothing to reclaim.
    #[error("no empty slab to reclaim")]
    NoEmptyRegion,
    /// The handle was cleaned or never issued.
    #[error("invalid pool handle")]
    InvalidHandle,
    /// The arena buffer cannot hold its metadata plus two pages.
    #[error("arena buffer too small")]
    ArenaTooSmall,
    /// A process-wide arena is already installed.
    #[error("an arena is already installed")]
    AlreadyInstalled,
    /// An unprotected pool was entered from two threads at once.
    #[error("unprotected pool accessed concurrently")]
    Contended,
}

impl PoolError {
    /// Stable machine-readable label, used as the lifecycle outcome.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidConfiguration => "invalid_configuration",
            Self::OutOfMemory => "out_of_memory",
            Self::NoMoreMemory => "no_more_memory",
            Self::AddressNotOwned => "address_not_owned",
            Self::DoublePush => "double_push",
            Self::NoEmptyRegion => "no_empty_region",
            Self::InvalidHandle => "invalid_handle",
            Self::ArenaTooSmall => "arena_too_small",
            Self::AlreadyInstalled => "already_installed",
            Self::Contended => "contended",
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_serde_names() {
        for err in [
            PoolError::InvalidConfiguration,
            PoolError::DoublePush,
            PoolError::NoEmptyRegion,
            PoolError::Contended,
        ] {
            let json = serde_json::to_string(&err).unwrap();
            assert_eq!(json, format!("\"{}\"", err.code()));
        }
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(
            PoolError::AddressNotOwned.to_string(),
            "address not owned by this pool"
        );
    }
}
