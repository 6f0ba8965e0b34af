//! Structured allocator lifecycle log.
//!
//! Every allocator decision appends an [`AllocatorLogRecord`] to a bounded
//! ring. Records below the configured level are dropped before their details
//! string is built; when the ring is full the oldest record is evicted and
//! counted in [`LifecycleLog::dropped`].

use crate::tier::TierId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

pub use tieralloc_membrane::LogLevel;

/// Default ring capacity.
pub const DEFAULT_LOG_CAPACITY: usize = 4096;

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    pub level: LogLevel,
    /// API symbol (`allocate`, `free`, `realloc`, `disable`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `fallback`, `double_free_detected`, ...).
    pub event: &'static str,
    pub handle: Option<usize>,
    pub size: Option<usize>,
    pub tier: Option<TierId>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
    /// Snapshot: live allocation count after the event.
    pub live_count: usize,
}

/// Identifying fields of one log event.
#[derive(Debug, Clone, Copy)]
pub struct LogFields {
    pub symbol: &'static str,
    pub event: &'static str,
    pub outcome: &'static str,
    pub handle: Option<usize>,
    pub size: Option<usize>,
    pub tier: Option<TierId>,
}

impl LogFields {
    #[must_use]
    pub const fn new(symbol: &'static str, event: &'static str, outcome: &'static str) -> Self {
        Self {
            symbol,
            event,
            outcome,
            handle: None,
            size: None,
            tier: None,
        }
    }

    #[must_use]
    pub const fn handle(mut self, handle: usize) -> Self {
        self.handle = Some(handle);
        self
    }

    #[must_use]
    pub const fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub const fn tier(mut self, tier: TierId) -> Self {
        self.tier = Some(tier);
        self
    }
}

#[derive(Debug)]
pub struct LifecycleLog {
    min_level: LogLevel,
    capacity: usize,
    next_decision_id: AtomicU64,
    dropped: AtomicU64,
    ring: Mutex<VecDeque<AllocatorLogRecord>>,
}

impl LifecycleLog {
    #[must_use]
    pub fn new(min_level: LogLevel, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            min_level,
            capacity,
            next_decision_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY))),
        }
    }

    #[must_use]
    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Append a record; `details` is only evaluated if `level` passes the filter.
    pub fn record<D>(&self, level: LogLevel, fields: LogFields, live_count: usize, details: D)
    where
        D: FnOnce() -> String,
    {
        if !self.enabled(level) {
            return;
        }
        let decision_id = self.next_decision_id.fetch_add(1, Ordering::Relaxed);
        let record = AllocatorLogRecord {
            decision_id,
            trace_id: format!("tieralloc::core::{}::{:016x}", fields.symbol, decision_id),
            level,
            symbol: fields.symbol,
            event: fields.event,
            handle: fields.handle,
            size: fields.size,
            tier: fields.tier,
            outcome: fields.outcome,
            details: details(),
            live_count,
        };

        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        ring.push_back(record);
    }

    /// Take every buffered record, oldest first.
    pub fn drain(&self) -> Vec<AllocatorLogRecord> {
        self.ring.lock().drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records evicted because the ring was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for LifecycleLog {
    fn default() -> Self {
        Self::new(LogLevel::Info, DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_records_skip_details() {
        let log = LifecycleLog::new(LogLevel::Warn, 8);
        log.record(LogLevel::Debug, LogFields::new("free", "free", "success"), 0, || {
            panic!("details must not be built for filtered records")
        });
        assert!(log.is_empty());
        log.record(
            LogLevel::Warn,
            LogFields::new("free", "double_free_detected", "rejected").handle(0x1000),
            0,
            || "pointer_observed_in_recently_freed_set".to_string(),
        );
        let records = log.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].handle, Some(0x1000));
        assert_eq!(records[0].trace_id, "tieralloc::core::free::0000000000000001");
    }

    #[test]
    fn ring_evicts_oldest() {
        let log = LifecycleLog::new(LogLevel::Trace, 2);
        for _ in 0..5 {
            log.record(
                LogLevel::Info,
                LogFields::new("allocate", "alloc", "success").size(1),
                1,
                String::new,
            );
        }
        assert_eq!(log.dropped(), 3);
        let ids: Vec<_> = log.drain().iter().map(|r| r.decision_id).collect();
        assert_eq!(ids, vec![4, 5]);
        assert!(log.is_empty());
    }
}
