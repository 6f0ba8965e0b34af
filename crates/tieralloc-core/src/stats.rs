//! Per-tier allocation counters.
//!
//! All counters are relaxed atomics: readers may see a snapshot that is a few
//! operations stale, but never block an allocation.

use crate::tier::TierId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct TierCounters {
    alloc_calls: AtomicU64,
    free_calls: AtomicU64,
    bytes_current: AtomicU64,
    bytes_total_alloc: AtomicU64,
    bytes_total_freed: AtomicU64,
    simulated_wait_ns: AtomicU64,
    fallbacks: AtomicU64,
    failures: AtomicU64,
    detached: AtomicU64,
}

#[derive(Debug, Default)]
pub struct AllocatorStats {
    tiers: [TierCounters; TierId::COUNT],
}

/// Point-in-time copy of the counters. Arrays are indexed by the C tier value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub alloc_calls: [u64; TierId::COUNT],
    pub free_calls: [u64; TierId::COUNT],
    pub bytes_current: [u64; TierId::COUNT],
    pub bytes_total_alloc: [u64; TierId::COUNT],
    pub bytes_total_freed: [u64; TierId::COUNT],
    pub simulated_wait_ns: [u64; TierId::COUNT],
    /// Requests that overflowed out of this tier.
    pub fallbacks: [u64; TierId::COUNT],
    /// Requests that started in this tier and found no tier at all.
    pub failures: [u64; TierId::COUNT],
    /// Allocations handed over to the native heap by a drain.
    pub detached: [u64; TierId::COUNT],
    pub live_allocations: usize,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    #[must_use]
    pub fn total_alloc_calls(&self) -> u64 {
        self.alloc_calls.iter().sum()
    }
}

impl AllocatorStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tier(&self, tier: TierId) -> &TierCounters {
        &self.tiers[tier.index()]
    }

    pub fn record_alloc(&self, tier: TierId, bytes: u64) {
        let c = self.tier(tier);
        c.alloc_calls.fetch_add(1, Ordering::Relaxed);
        c.bytes_current.fetch_add(bytes, Ordering::Relaxed);
        c.bytes_total_alloc.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_free(&self, tier: TierId, bytes: u64) {
        let c = self.tier(tier);
        c.free_calls.fetch_add(1, Ordering::Relaxed);
        sub_saturating(&c.bytes_current, bytes);
        c.bytes_total_freed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// The allocation left the tier without a free call.
    pub fn record_detach(&self, tier: TierId, bytes: u64) {
        let c = self.tier(tier);
        c.detached.fetch_add(1, Ordering::Relaxed);
        sub_saturating(&c.bytes_current, bytes);
    }

    pub fn record_wait(&self, tier: TierId, wait_ns: u64) {
        self.tier(tier)
            .simulated_wait_ns
            .fetch_add(wait_ns, Ordering::Relaxed);
    }

    pub fn record_fallback(&self, tier: TierId) {
        self.tier(tier).fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, tier: TierId) {
        self.tier(tier).failures.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self, live_allocations: usize) -> StatsSnapshot {
        let read = |f: fn(&TierCounters) -> &AtomicU64| {
            TierId::ALL.map(|id| f(self.tier(id)).load(Ordering::Relaxed))
        };
        StatsSnapshot {
            alloc_calls: read(|c| &c.alloc_calls),
            free_calls: read(|c| &c.free_calls),
            bytes_current: read(|c| &c.bytes_current),
            bytes_total_alloc: read(|c| &c.bytes_total_alloc),
            bytes_total_freed: read(|c| &c.bytes_total_freed),
            simulated_wait_ns: read(|c| &c.simulated_wait_ns),
            fallbacks: read(|c| &c.fallbacks),
            failures: read(|c| &c.failures),
            detached: read(|c| &c.detached),
            live_allocations,
        }
    }
}

fn sub_saturating(counter: &AtomicU64, bytes: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(bytes))
    });
}
