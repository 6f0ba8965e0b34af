//! Tiered allocator core.
//!
//! Places requests in the tier their hint resolves to and walks that tier's
//! fallback chain when it is full. Per tier the sequence is: reserve capacity
//! (lock-free CAS), charge the throttle, acquire memory from the backing.
//! Every live allocation has exactly one [`AllocationRecord`]; frees always go
//! back to the recorded tier.

use crate::error::TierError;
use crate::hint::{Hint, HintCell, HintScope};
use crate::lifecycle::AllocatorHooks;
use crate::log::{AllocatorLogRecord, DEFAULT_LOG_CAPACITY, LifecycleLog, LogFields, LogLevel};
use crate::records::{AllocationRecord, Handle, HandleState, Miss, RecordTable};
use crate::resolver::{HintResolver, HintSource, Resolution, SYSTEM_DEFAULT_HINT};
use crate::stats::{AllocatorStats, StatsSnapshot};
use crate::throttle::Throttle;
use crate::tier::TierId;
use crate::tier::registry::TierRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use tieralloc_membrane::{RuntimeConfig, TierBacking};

/// Construction knobs that do not belong to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorOptions {
    /// Initial process-wide default hint.
    pub default_hint: Hint,
    pub log_level: LogLevel,
    pub log_capacity: usize,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            default_hint: Hint::Warm,
            log_level: LogLevel::Info,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

/// Memory obtained from one tier, not yet recorded.
#[derive(Debug, Clone, Copy)]
struct Placement {
    addr: usize,
    reserved: usize,
    tier: TierId,
    wait_ns: u64,
}

pub struct TieredAllocator<B: TierBacking> {
    registry: TierRegistry,
    backing: B,
    records: RecordTable,
    stats: AllocatorStats,
    throttle: Throttle,
    default_hint: HintCell,
    logs: LifecycleLog,
    next_sequence: AtomicU64,
}

impl<B: TierBacking> TieredAllocator<B> {
    #[must_use]
    pub fn new(registry: TierRegistry, backing: B) -> Self {
        Self::with_options(registry, backing, AllocatorOptions::default())
    }

    #[must_use]
    pub fn with_options(registry: TierRegistry, backing: B, options: AllocatorOptions) -> Self {
        let throttle = Throttle::from_registry(&registry);
        Self {
            registry,
            backing,
            records: RecordTable::new(),
            stats: AllocatorStats::new(),
            throttle,
            default_hint: HintCell::new(options.default_hint),
            logs: LifecycleLog::new(options.log_level, options.log_capacity),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Build the registry and options from a resolved runtime configuration.
    ///
    /// Rejected configuration values and an unknown `TA_DEFAULT_HINT` are
    /// logged at WARN; the affected settings keep their defaults.
    pub fn from_config(config: &RuntimeConfig, backing: B) -> Result<Self, TierError> {
        let registry = TierRegistry::from_config(config)?;
        let options = AllocatorOptions {
            log_level: config.log_level,
            ..AllocatorOptions::default()
        };
        let allocator = Self::with_options(registry, backing, options);
        for issue in &config.issues {
            allocator.log(
                LogLevel::Warn,
                LogFields::new("init", "config_rejected", "ignored"),
                || issue.to_string(),
            );
        }
        if let Some(raw) = &config.default_hint {
            // Failure is logged by the setter; the default stays `warm`.
            let _ = allocator.set_default_hint_str(raw);
        }
        Ok(allocator)
    }

    #[must_use]
    pub fn registry(&self) -> &TierRegistry {
        &self.registry
    }

    #[must_use]
    pub fn backing(&self) -> &B {
        &self.backing
    }

    // -- global hint ---------------------------------------------------------

    #[must_use]
    pub fn default_hint(&self) -> Hint {
        self.default_hint.get()
    }

    pub fn set_default_hint(&self, hint: Hint) {
        let previous = self.default_hint.replace(hint);
        self.log(
            LogLevel::Info,
            LogFields::new("set_default_hint", "default_hint", "applied"),
            || format!("previous={previous} current={hint}"),
        );
    }

    /// Parse and apply a hint name. Unknown names leave the value unchanged.
    pub fn set_default_hint_str(&self, raw: &str) -> Result<Hint, TierError> {
        match raw.parse::<Hint>() {
            Ok(hint) => {
                self.set_default_hint(hint);
                Ok(hint)
            }
            Err(err) => {
                self.log(
                    LogLevel::Warn,
                    LogFields::new("set_default_hint", "invalid_hint", "rejected"),
                    || format!("value={raw:?} current={}", self.default_hint.get()),
                );
                Err(err)
            }
        }
    }

    /// Apply a C hint value; `0` selects the system default.
    pub fn set_default_hint_raw(&self, raw: i64) -> Result<Hint, TierError> {
        match Hint::from_raw(raw) {
            Ok(hint) => {
                let hint = hint.unwrap_or(SYSTEM_DEFAULT_HINT);
                self.set_default_hint(hint);
                Ok(hint)
            }
            Err(err) => {
                self.log(
                    LogLevel::Warn,
                    LogFields::new("set_default_hint", "invalid_hint", "rejected"),
                    || format!("raw={raw} current={}", self.default_hint.get()),
                );
                Err(err)
            }
        }
    }

    /// Override the default hint until the returned guard is dropped.
    pub fn hint_scope(&self, hint: Hint) -> HintScope<'_> {
        HintScope::enter(&self.default_hint, hint)
    }

    #[must_use]
    pub fn default_hint_cell(&self) -> &HintCell {
        &self.default_hint
    }

    // -- allocation ----------------------------------------------------------

    /// Allocate `size` bytes (zero is rounded up to one).
    pub fn allocate(&self, size: usize, hint: Option<Hint>) -> Result<Handle, TierError> {
        self.allocate_as("allocate", size, hint)
            .map(|record| record.handle)
    }

    /// Allocate `count * size` zeroed bytes.
    pub fn calloc(&self, count: usize, size: usize, hint: Option<Hint>) -> Result<Handle, TierError> {
        let Some(total) = count.checked_mul(size) else {
            self.log(
                LogLevel::Warn,
                LogFields::new("calloc", "size_overflow", "rejected"),
                || format!("count={count} size={size}"),
            );
            return Err(TierError::SizeOverflow { count, size });
        };

        let record = self.allocate_as("calloc", total, hint)?;
        if !self.backing.zero(record.handle.addr(), record.size) {
            self.log(
                LogLevel::Error,
                LogFields::new("calloc", "zero_fill_refused", "failed")
                    .handle(record.handle.addr())
                    .tier(record.tier),
                || "backing_does_not_own_block".to_string(),
            );
            let _ = self.records.remove(record.handle);
            self.release_record("calloc", record);
            return Err(TierError::OutOfMemory {
                requested: total,
                tried: vec![record.tier],
            });
        }
        Ok(record.handle)
    }

    /// Release an allocation to the tier it was recorded in.
    pub fn free(&self, handle: Handle) -> Result<(), TierError> {
        let record = self.take("free", handle)?;
        self.release_record("free", record);
        self.log(
            LogLevel::Trace,
            LogFields::new("free", "free", "success")
                .handle(handle.addr())
                .size(record.size)
                .tier(record.tier),
            || format!("seq={} reserved={}", record.sequence, record.reserved),
        );
        Ok(())
    }

    /// Resize an allocation.
    ///
    /// Without a hint the allocation stays in its recorded tier (falling back
    /// along that tier's chain only if it has to move). With a hint the new
    /// block is placed where the hint resolves. On error the original
    /// allocation is untouched.
    pub fn realloc(
        &self,
        handle: Handle,
        new_size: usize,
        hint: Option<Hint>,
    ) -> Result<Handle, TierError> {
        let new_size = new_size.max(1);
        let record = self.take("realloc", handle)?;

        let target = match hint {
            None => record.tier,
            Some(hint) => match self.resolve("realloc", Some(hint)) {
                Ok(resolution) => resolution.tier,
                Err(err) => {
                    self.records.restore(record);
                    return Err(err);
                }
            },
        };

        if target == record.tier && new_size <= record.reserved {
            self.records.restore(AllocationRecord {
                size: new_size,
                ..record
            });
            self.log(
                LogLevel::Trace,
                LogFields::new("realloc", "realloc_in_place", "success")
                    .handle(handle.addr())
                    .size(new_size)
                    .tier(record.tier),
                || format!("old_size={} reserved={}", record.size, record.reserved),
            );
            return Ok(handle);
        }

        let placed = match self.place("realloc", new_size, target) {
            Ok(placed) => placed,
            Err(err) => {
                self.records.restore(record);
                return Err(err);
            }
        };

        if hint.is_none() && placed.tier != record.tier {
            self.log(
                LogLevel::Info,
                LogFields::new("realloc", "realloc_affinity_fallback", "success")
                    .handle(placed.handle.addr())
                    .size(new_size)
                    .tier(placed.tier),
                || format!("recorded_tier={}", record.tier),
            );
        }

        let copy_len = record.size.min(new_size);
        if !self.transfer("realloc", &record, &placed, copy_len) {
            return Err(TierError::InvalidHandle {
                handle: handle.addr(),
            });
        }
        self.release_record("realloc", record);
        self.log(
            LogLevel::Trace,
            LogFields::new("realloc", "realloc_moved", "success")
                .handle(placed.handle.addr())
                .size(new_size)
                .tier(placed.tier),
            || format!("from={} copied={copy_len}", handle),
        );
        Ok(placed.handle)
    }

    /// Migrate an allocation to `dst`, charging a read on the source tier and
    /// a write on the destination. The destination is used as-is: no fallback.
    pub fn move_to(&self, handle: Handle, dst: TierId) -> Result<Handle, TierError> {
        if let Err(err) = self.registry.resolve(dst) {
            self.log(
                LogLevel::Warn,
                LogFields::new("move", "unknown_tier", "rejected").handle(handle.addr()),
                || err.to_string(),
            );
            return Err(err);
        }

        let record = self.take("move", handle)?;
        if record.tier == dst {
            self.records.restore(record);
            self.log(
                LogLevel::Debug,
                LogFields::new("move", "move_same_tier", "noop")
                    .handle(handle.addr())
                    .tier(dst),
                String::new,
            );
            return Ok(handle);
        }

        let read_wait = self.throttle.charge(record.tier, record.reserved as u64);
        self.stats.record_wait(record.tier, read_wait);

        let placement = match self.try_tier("move", dst, record.size) {
            Ok(Some(placement)) => placement,
            Ok(None) => {
                self.records.restore(record);
                self.stats.record_failure(dst);
                self.log(
                    LogLevel::Warn,
                    LogFields::new("move", "destination_full", "failed")
                        .handle(handle.addr())
                        .size(record.size)
                        .tier(dst),
                    || format!("src={}", record.tier),
                );
                return Err(TierError::OutOfMemory {
                    requested: record.size,
                    tried: vec![dst],
                });
            }
            Err(err) => {
                self.records.restore(record);
                return Err(err);
            }
        };

        let moved = self.commit(placement, record.size);
        if !self.transfer("move", &record, &moved, record.size) {
            return Err(TierError::InvalidHandle {
                handle: handle.addr(),
            });
        }
        self.release_record("move", record);
        self.log(
            LogLevel::Info,
            LogFields::new("move", "move", "success")
                .handle(moved.handle.addr())
                .size(record.size)
                .tier(dst),
            || {
                format!(
                    "from={} src={} read_wait_ns={read_wait} write_wait_ns={}",
                    handle, record.tier, placement.wait_ns
                )
            },
        );
        Ok(moved.handle)
    }

    /// Placement advice for a live allocation. Validated, logged, otherwise
    /// without effect.
    pub fn advise(&self, handle: Handle, hint: Hint) -> Result<(), TierError> {
        let Some(record) = self.records.get(handle) else {
            self.log(
                LogLevel::Warn,
                LogFields::new("advise", "unknown_handle", "rejected").handle(handle.addr()),
                String::new,
            );
            return Err(TierError::InvalidHandle {
                handle: handle.addr(),
            });
        };
        self.log(
            LogLevel::Debug,
            LogFields::new("advise", "advise", "noop")
                .handle(handle.addr())
                .tier(record.tier),
            || format!("hint={hint} preferred_tier={}", hint.preferred_tier()),
        );
        Ok(())
    }

    /// Tier an allocation was recorded in.
    pub fn tier_of(&self, handle: Handle) -> Result<TierId, TierError> {
        self.records
            .get(handle)
            .map(|record| record.tier)
            .ok_or(TierError::InvalidHandle {
                handle: handle.addr(),
            })
    }

    #[must_use]
    pub fn handle_state(&self, handle: Handle) -> HandleState {
        self.records.state(handle)
    }

    /// Charge a transfer against a tier's throttle without allocating.
    pub fn charge(&self, tier: TierId, bytes: u64) -> Result<u64, TierError> {
        self.registry.resolve(tier)?;
        Ok(self.throttle.charge(tier, bytes))
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.records.len()
    }

    /// Bytes currently reserved in `tier`.
    pub fn usage(&self, tier: TierId) -> Result<u64, TierError> {
        self.registry.resolve(tier).map(|tier| tier.usage())
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.records.len())
    }

    /// Detach every live allocation: the records and tier reservations go
    /// away, the memory itself stays with the backing's native owner.
    pub fn drain_live(&self) -> usize {
        let drained = self.records.drain_all();
        for record in &drained {
            let detached = self.backing.detach(record.handle.addr());
            if let Ok(tier) = self.registry.resolve(record.tier) {
                tier.release(record.reserved as u64);
            }
            self.stats.record_detach(record.tier, record.reserved as u64);
            self.log(
                LogLevel::Debug,
                LogFields::new("disable", "detach", if detached { "detached" } else { "untracked" })
                    .handle(record.handle.addr())
                    .size(record.size)
                    .tier(record.tier),
                || format!("seq={}", record.sequence),
            );
        }
        drained.len()
    }

    // -- lifecycle log -------------------------------------------------------

    pub fn drain_lifecycle_logs(&self) -> Vec<AllocatorLogRecord> {
        self.logs.drain()
    }

    #[must_use]
    pub fn lifecycle_log(&self) -> &LifecycleLog {
        &self.logs
    }

    pub(crate) fn log<D>(&self, level: LogLevel, fields: LogFields, details: D)
    where
        D: FnOnce() -> String,
    {
        self.logs.record(level, fields, self.records.len(), details);
    }

    // -- internals -----------------------------------------------------------

    fn resolve(&self, symbol: &'static str, call: Option<Hint>) -> Result<Resolution, TierError> {
        let resolver = HintResolver::new(&self.registry);
        match resolver.resolve_hint(call, Some(self.default_hint.get())) {
            Ok(resolution) => {
                if let Some(requested) = call.filter(|_| resolution.source != HintSource::Call) {
                    self.log(
                        LogLevel::Debug,
                        LogFields::new(symbol, "hint_unavailable", "degraded").tier(resolution.tier),
                        || format!("requested={requested} via={}", resolution.source.as_str()),
                    );
                }
                Ok(resolution)
            }
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    LogFields::new(symbol, "hint_unresolved", "failed"),
                    || err.to_string(),
                );
                Err(err)
            }
        }
    }

    fn allocate_as(
        &self,
        symbol: &'static str,
        size: usize,
        hint: Option<Hint>,
    ) -> Result<AllocationRecord, TierError> {
        let size = size.max(1);
        let resolution = self.resolve(symbol, hint)?;
        let record = self.place(symbol, size, resolution.tier)?;
        self.log(
            LogLevel::Trace,
            LogFields::new(symbol, "alloc", "success")
                .handle(record.handle.addr())
                .size(size)
                .tier(record.tier),
            || {
                format!(
                    "hint={} source={} seq={}",
                    resolution.hint,
                    resolution.source.as_str(),
                    record.sequence
                )
            },
        );
        Ok(record)
    }

    /// Walk the fallback chain of `start` until a tier accepts the request.
    fn place(
        &self,
        symbol: &'static str,
        size: usize,
        start: TierId,
    ) -> Result<AllocationRecord, TierError> {
        let mut tried = Vec::with_capacity(TierId::COUNT);
        for tier in self.registry.fallback_chain(start) {
            tried.push(tier);
            if let Some(placement) = self.try_tier(symbol, tier, size)? {
                if tier != start {
                    let depth = tried.len() - 1;
                    self.log(
                        LogLevel::Info,
                        LogFields::new(symbol, "fallback", "success").size(size).tier(tier),
                        || format!("from={start} depth={depth}"),
                    );
                }
                return Ok(self.commit(placement, size));
            }
            self.stats.record_fallback(tier);
        }

        self.stats.record_failure(start);
        self.log(
            LogLevel::Warn,
            LogFields::new(symbol, "oom", "failed").size(size).tier(start),
            || format!("tried={tried:?}"),
        );
        Err(TierError::OutOfMemory {
            requested: size,
            tried,
        })
    }

    /// One attempt against one tier. `Ok(None)` means "full, try the next".
    fn try_tier(
        &self,
        symbol: &'static str,
        tier_id: TierId,
        size: usize,
    ) -> Result<Option<Placement>, TierError> {
        let tier = self.registry.resolve(tier_id)?;
        let reserved = self
            .backing
            .footprint(tier.strategy(), size)
            .ok_or(TierError::SizeOverflow { count: 1, size })?;

        if !tier.try_reserve(reserved as u64) {
            self.log(
                LogLevel::Debug,
                LogFields::new(symbol, "capacity_exhausted", "overflow")
                    .size(size)
                    .tier(tier_id),
                || {
                    format!(
                        "usage={} reserved={reserved} capacity={:?}",
                        tier.usage(),
                        tier.capacity()
                    )
                },
            );
            return Ok(None);
        }

        let wait_ns = self.throttle.charge(tier_id, reserved as u64);
        self.stats.record_wait(tier_id, wait_ns);

        let Some(addr) = self.backing.acquire(tier.strategy(), size) else {
            tier.release(reserved as u64);
            self.log(
                LogLevel::Warn,
                LogFields::new(symbol, "backing_exhausted", "overflow")
                    .size(size)
                    .tier(tier_id),
                || format!("strategy={}", tier.strategy().as_str()),
            );
            return Ok(None);
        };

        Ok(Some(Placement {
            addr,
            reserved,
            tier: tier_id,
            wait_ns,
        }))
    }

    fn commit(&self, placement: Placement, size: usize) -> AllocationRecord {
        let record = AllocationRecord {
            handle: Handle::new(placement.addr),
            size,
            reserved: placement.reserved,
            tier: placement.tier,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        };
        if !self.records.insert(record) {
            self.log(
                LogLevel::Error,
                LogFields::new("allocate", "record_collision", "inconsistent")
                    .handle(placement.addr)
                    .tier(placement.tier),
                || "backing returned a live address".to_string(),
            );
        }
        self.stats.record_alloc(placement.tier, placement.reserved as u64);
        record
    }

    /// Copy `len` bytes from `old` into `new`. On failure `new` is released
    /// and `old` is restored.
    fn transfer(
        &self,
        symbol: &'static str,
        old: &AllocationRecord,
        new: &AllocationRecord,
        len: usize,
    ) -> bool {
        if self.backing.copy(old.handle.addr(), new.handle.addr(), len) {
            return true;
        }
        self.log(
            LogLevel::Error,
            LogFields::new(symbol, "copy_refused", "failed")
                .handle(old.handle.addr())
                .size(len)
                .tier(old.tier),
            || format!("dst={}", new.handle),
        );
        let _ = self.records.remove(new.handle);
        self.release_record(symbol, *new);
        self.records.restore(*old);
        false
    }

    fn take(&self, symbol: &'static str, handle: Handle) -> Result<AllocationRecord, TierError> {
        match self.records.remove(handle) {
            Ok(record) => Ok(record),
            Err(miss) => {
                let (event, details) = match miss {
                    Miss::DoubleFree => ("double_free_detected", "handle_observed_in_recently_freed_set"),
                    Miss::Unknown => ("unknown_handle", "handle_not_present_in_record_table"),
                };
                self.log(
                    LogLevel::Warn,
                    LogFields::new(symbol, event, "rejected").handle(handle.addr()),
                    || details.to_string(),
                );
                Err(TierError::InvalidHandle {
                    handle: handle.addr(),
                })
            }
        }
    }

    fn release_record(&self, symbol: &'static str, record: AllocationRecord) {
        if !self.backing.release(record.handle.addr()) {
            self.log(
                LogLevel::Error,
                LogFields::new(symbol, "backing_release_refused", "inconsistent")
                    .handle(record.handle.addr())
                    .tier(record.tier),
                String::new,
            );
        }
        if let Ok(tier) = self.registry.resolve(record.tier) {
            tier.release(record.reserved as u64);
        }
        self.stats.record_free(record.tier, record.reserved as u64);
    }
}

impl<B: TierBacking> AllocatorHooks for TieredAllocator<B> {
    fn allocate(&self, size: usize) -> Result<usize, TierError> {
        TieredAllocator::allocate(self, size, None).map(Handle::addr)
    }

    fn free(&self, addr: usize) -> Result<(), TierError> {
        if addr == 0 {
            return Ok(());
        }
        TieredAllocator::free(self, Handle::new(addr))
    }

    fn realloc(&self, addr: usize, size: usize) -> Result<usize, TierError> {
        if addr == 0 {
            return AllocatorHooks::allocate(self, size);
        }
        TieredAllocator::realloc(self, Handle::new(addr), size, None).map(Handle::addr)
    }
}
