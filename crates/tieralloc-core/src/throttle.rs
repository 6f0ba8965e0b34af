//! Bandwidth throttle model.
//!
//! One token bucket per tier: tokens are bytes, refilled at the tier bandwidth
//! and capped at a 10 ms burst. A charge never sleeps; it returns the wait a
//! real device would impose (base latency plus the time to earn the missing
//! tokens) so callers can account for it.

use crate::tier::registry::TierRegistry;
use crate::tier::{CostModel, TierId};
use parking_lot::Mutex;
use std::time::Instant;

/// Burst window as a fraction of one second.
const BURST_SECONDS: f64 = 0.010;

#[derive(Debug)]
struct Bucket {
    rate_bps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
    base_latency_ns: u64,
}

impl Bucket {
    fn new(cost: CostModel, now: Instant) -> Self {
        let rate_bps = cost.bandwidth_bps.max(1.0);
        let burst = (rate_bps * BURST_SECONDS).max(1.0);
        Self {
            rate_bps,
            burst,
            tokens: burst,
            last: now,
            base_latency_ns: cost.base_latency_ns,
        }
    }
}

#[derive(Debug)]
pub struct Throttle {
    buckets: [Mutex<Bucket>; TierId::COUNT],
}

impl Throttle {
    #[must_use]
    pub fn new(costs: [CostModel; TierId::COUNT]) -> Self {
        let now = Instant::now();
        Self {
            buckets: std::array::from_fn(|idx| Mutex::new(Bucket::new(costs[idx], now))),
        }
    }

    /// Buckets for every registered tier; unregistered slots keep built-in costs.
    #[must_use]
    pub fn from_registry(registry: &TierRegistry) -> Self {
        Self::new(TierId::ALL.map(|id| {
            registry
                .resolve(id)
                .map_or_else(|_| CostModel::default_for(id), |tier| tier.cost())
        }))
    }

    /// Charge a transfer of `bytes` against `tier`; returns the simulated wait.
    pub fn charge(&self, tier: TierId, bytes: u64) -> u64 {
        self.charge_at(tier, bytes, Instant::now())
    }

    /// [`Throttle::charge`] with an explicit clock reading.
    pub fn charge_at(&self, tier: TierId, bytes: u64, now: Instant) -> u64 {
        let mut bucket = self.buckets[tier.index()].lock();

        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.last = bucket.last.max(now);
        bucket.tokens = (bucket.tokens + bucket.rate_bps * elapsed).min(bucket.burst);

        let wanted = bytes as f64;
        let mut wait_ns = bucket.base_latency_ns;
        if wanted <= bucket.tokens {
            bucket.tokens -= wanted;
        } else {
            let deficit = wanted - bucket.tokens;
            let extra = deficit / bucket.rate_bps * 1_000_000_000.0;
            wait_ns = wait_ns.saturating_add(extra as u64);
            bucket.tokens = 0.0;
        }
        wait_ns
    }

    /// Burst size of a tier's bucket in bytes.
    #[must_use]
    pub fn burst_bytes(&self, tier: TierId) -> f64 {
        self.buckets[tier.index()].lock().burst
    }
}
