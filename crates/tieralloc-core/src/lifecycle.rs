//! Structured lifecycle records.
//!
//! Every registry and arena shares a bounded [`LifecycleLog`]. Records
//! below the configured threshold are discarded before their details
//! are formatted; the rest can be drained or rendered as JSONL.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config;

/// Lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parses a threshold name (case-insensitive). `off`/`none` yield
    /// `None`; unknown names fall back to `Info`.
    #[must_use]
    pub fn threshold_from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "off" | "none" | "disabled" => None,
            _ => Some(Self::Info),
        }
    }
}

/// Allocator tier that emitted a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Arena,
    SlotTable,
    Fixed,
    Variable,
}

impl Component {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Arena => "arena",
            Self::SlotTable => "slot_table",
            Self::Fixed => "fixed",
            Self::Variable => "variable",
        }
    }
}

/// What an event was about: pool handle, pointer and size, each optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Subject {
    pub pool: Option<usize>,
    pub ptr: Option<usize>,
    pub size: Option<usize>,
}

impl Subject {
    #[must_use]
    pub const fn none() -> Self {
        Self {
            pool: None,
            ptr: None,
            size: None,
        }
    }

    #[must_use]
    pub const fn pool(pool: usize) -> Self {
        Self {
            pool: Some(pool),
            ptr: None,
            size: None,
        }
    }

    #[must_use]
    pub const fn with_ptr(mut self, ptr: usize) -> Self {
        self.ptr = Some(ptr);
        self
    }

    #[must_use]
    pub const fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }
}

/// Structured lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id, `tieralloc::<component>::<id>`.
    pub trace_id: String,
    pub level: LogLevel,
    pub component: Component,
    /// Event kind (`slab_created`, `gc`, `overflow_alloc`, ...).
    pub event: &'static str,
    pub pool: Option<usize>,
    pub ptr: Option<usize>,
    pub size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
}

/// Bounded, thread-safe ring of lifecycle records.
pub struct LifecycleLog {
    threshold: Option<LogLevel>,
    capacity: usize,
    next_decision_id: AtomicU64,
    records: Mutex<VecDeque<LifecycleRecord>>,
}

impl LifecycleLog {
    pub const DEFAULT_CAPACITY: usize = 4096;

    /// Log using the `TIERALLOC_LOG` threshold.
    #[must_use]
    pub fn new() -> Self {
        Self::with_threshold(config::log_threshold(), Self::DEFAULT_CAPACITY)
    }

    /// Log with an explicit threshold (`None` keeps nothing) and ring size.
    #[must_use]
    pub fn with_threshold(threshold: Option<LogLevel>, capacity: usize) -> Self {
        Self {
            threshold,
            capacity: capacity.max(1),
            next_decision_id: AtomicU64::new(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.threshold.is_some_and(|threshold| level >= threshold)
    }

    pub fn record(
        &self,
        level: LogLevel,
        component: Component,
        event: &'static str,
        subject: Subject,
        outcome: &'static str,
        details: impl FnOnce() -> String,
    ) {
        if !self.enabled(level) {
            return;
        }
        let decision_id = self.next_decision_id.fetch_add(1, Ordering::Relaxed);
        let record = LifecycleRecord {
            decision_id,
            trace_id: format!("tieralloc::{}::{:016x}", component.as_str(), decision_id),
            level,
            component,
            event,
            pool: subject.pool,
            ptr: subject.ptr,
            size: subject.size,
            outcome,
            details: details(),
        };
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Snapshot of the retained records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<LifecycleRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Removes and returns the retained records.
    pub fn drain(&self) -> Vec<LifecycleRecord> {
        self.records.lock().drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders the retained records as one JSON object per line.
    pub fn to_jsonl(&self) -> serde_json::Result<String> {
        let records = self.records.lock();
        let mut out = String::new();
        for record in records.iter() {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }
}

impl Default for LifecycleLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleLog")
            .field("threshold", &self.threshold)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
