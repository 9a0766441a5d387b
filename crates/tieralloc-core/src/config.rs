//! Allocator configuration.
//!
//! Two environment variables are read once per process:
//! - `TIERALLOC_LOG`: lifecycle log threshold (`trace`, `debug`, `info`
//!   (default), `warn`, `error`, `off`).
//! - `TIERALLOC_POISON`: `1`/`true`/`on` fills fresh and released pool
//!   memory with marker bytes for every pool, regardless of its options.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::lifecycle::LogLevel;

/// Arena page granularity in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Slot-table growth increment, one bitmap word.
pub const SLOT_GROUP: usize = 32;

/// Width of a slab bitmap word.
pub const BITMAP_WORD_BITS: usize = 64;

/// Slabs never hold fewer objects than one bitmap word.
pub const BITMAP_WORD_POWER: u32 = 6;

/// Largest accepted slab capacity exponent.
pub const MAX_CAPACITY_POWER: u32 = 24;

/// Minimum alignment every backing allocator returns.
pub const MIN_BACKING_ALIGN: usize = 16;

/// Capacity exponent of the pool holding overflow records.
pub const OVERFLOW_RECORD_POWER: u32 = 7;

/// Poison byte for freshly created slab storage.
pub const POISON_FRESH_STORAGE: u8 = 0x2A;

/// Poison byte for fresh slot-table capacity.
pub const POISON_FRESH_SLOTS: u8 = 0x2B;

/// Poison byte for released objects and slots.
pub const POISON_RELEASED: u8 = 0x2C;

/// Per-pool behavior switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PoolOptions {
    /// Serialize every operation on a per-pool lock. Without it a
    /// concurrent caller gets [`PoolError::Contended`](crate::PoolError::Contended).
    pub thread_protection: bool,
    /// Fill fresh and released memory with marker bytes.
    pub poison: bool,
}

impl PoolOptions {
    pub const NONE: Self = Self {
        thread_protection: false,
        poison: false,
    };

    pub const THREAD_PROTECTION: Self = Self {
        thread_protection: true,
        poison: false,
    };

    #[must_use]
    pub const fn with_poison(mut self) -> Self {
        self.poison = true;
        self
    }

    /// Poisoning requested by the options or forced by `TIERALLOC_POISON`.
    #[must_use]
    pub fn poison_enabled(self) -> bool {
        self.poison || poison_forced()
    }
}

/// Per-object formatting callback consumed by external statistics printers.
pub type DisplayFn = Arc<dyn Fn(NonNull<u8>) -> i32 + Send + Sync>;

/// Diagnostic description of a pool. The core never formats anything
/// itself; it only hands this back alongside the walk primitive.
#[derive(Clone, Default)]
pub struct PoolDescriptor {
    pub name: Option<String>,
    pub display: Option<DisplayFn>,
}

impl PoolDescriptor {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            display: None,
        }
    }

    #[must_use]
    pub fn with_display(mut self, display: impl Fn(NonNull<u8>) -> i32 + Send + Sync + 'static) -> Self {
        self.display = Some(Arc::new(display));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("anonymous")
    }

    /// Runs the display callback on one object, if one is configured.
    pub fn display(&self, object: NonNull<u8>) -> Option<i32> {
        self.display.as_ref().map(|display| display(object))
    }
}

impl fmt::Debug for PoolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolDescriptor")
            .field("name", &self.name)
            .field("display", &self.display.is_some())
            .finish()
    }
}

// Atomic caches: 0=unresolved, 255=resolving, anything else is a resolved
// value. A non-blocking state machine rather than OnceLock, so that an
// allocator installed under the host can be re-entered while std::env::var
// allocates.
const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 255;

static CACHED_LOG_THRESHOLD: AtomicU8 = AtomicU8::new(UNRESOLVED);
static CACHED_POISON: AtomicU8 = AtomicU8::new(UNRESOLVED);

const LOG_OFF: u8 = 6;
const POISON_OFF: u8 = 1;
const POISON_ON: u8 = 2;

fn resolve_cached(cell: &AtomicU8, var: &str, default: u8, parse: fn(&str) -> u8) -> u8 {
    let cached = cell.load(Ordering::Relaxed);
    if cached != UNRESOLVED && cached != RESOLVING {
        return cached;
    }
    if cached == RESOLVING {
        return default;
    }
    if cell
        .compare_exchange(UNRESOLVED, RESOLVING, Ordering::SeqCst, Ordering::Relaxed)
        .is_err()
    {
        let v = cell.load(Ordering::Relaxed);
        return if v != UNRESOLVED && v != RESOLVING {
            v
        } else {
            default
        };
    }
    let value = std::env::var(var).map(|raw| parse(&raw)).unwrap_or(default);
    cell.store(value, Ordering::Release);
    value
}

fn level_to_u8(level: Option<LogLevel>) -> u8 {
    match level {
        Some(LogLevel::Trace) => 1,
        Some(LogLevel::Debug) => 2,
        Some(LogLevel::Info) => 3,
        Some(LogLevel::Warn) => 4,
        Some(LogLevel::Error) => 5,
        None => LOG_OFF,
    }
}

fn u8_to_level(v: u8) -> Option<LogLevel> {
    match v {
        1 => Some(LogLevel::Trace),
        2 => Some(LogLevel::Debug),
        4 => Some(LogLevel::Warn),
        5 => Some(LogLevel::Error),
        LOG_OFF => None,
        _ => Some(LogLevel::Info),
    }
}

fn parse_log_env(raw: &str) -> u8 {
    level_to_u8(LogLevel::threshold_from_str_loose(raw))
}

fn parse_poison_env(raw: &str) -> u8 {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => POISON_ON,
        _ => POISON_OFF,
    }
}

/// Lifecycle log threshold from `TIERALLOC_LOG`; `None` disables logging.
#[must_use]
pub fn log_threshold() -> Option<LogLevel> {
    u8_to_level(resolve_cached(
        &CACHED_LOG_THRESHOLD,
        "TIERALLOC_LOG",
        level_to_u8(Some(LogLevel::Info)),
        parse_log_env,
    ))
}

/// Whether `TIERALLOC_POISON` forces poisoning on.
#[must_use]
pub fn poison_forced() -> bool {
    resolve_cached(&CACHED_POISON, "TIERALLOC_POISON", POISON_OFF, parse_poison_env) == POISON_ON
}
