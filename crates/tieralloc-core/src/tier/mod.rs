//! Tiers: named memory pools with a backing strategy, a capacity and a cost
//! model.
//!
//! Usage is tracked with a lock-free CAS reservation so `usage <= capacity`
//! holds at every instant; a request that does not fit overflows to the
//! tier's fallback instead.

pub mod registry;

use crate::error::TierError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tieralloc_membrane::BackingStrategy;
use tieralloc_membrane::config::{DEFAULT_TIERS, TierConfig};

/// Tier identifier. Discriminants match the C `ta_tier_t` values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TierId {
    PinFast = 0,
    Hot = 1,
    Cold = 2,
}

impl TierId {
    pub const COUNT: usize = 3;
    pub const ALL: [TierId; Self::COUNT] = [Self::PinFast, Self::Hot, Self::Cold];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn from_index(idx: usize) -> Option<Self> {
        match idx {
            0 => Some(Self::PinFast),
            1 => Some(Self::Hot),
            2 => Some(Self::Cold),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PinFast => "pin_fast",
            Self::Hot => "hot",
            Self::Cold => "cold",
        }
    }

    /// Backing strategy a tier uses unless configured otherwise.
    #[must_use]
    pub const fn default_strategy(self) -> BackingStrategy {
        match self {
            Self::PinFast => BackingStrategy::PinnedArena,
            Self::Hot => BackingStrategy::GeneralHeap,
            Self::Cold => BackingStrategy::OverflowStore,
        }
    }

    /// Default fallback edge: `pin_fast -> hot -> cold`.
    #[must_use]
    pub const fn default_fallback(self) -> Option<Self> {
        match self {
            Self::PinFast => Some(Self::Hot),
            Self::Hot => Some(Self::Cold),
            Self::Cold => None,
        }
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierId {
    type Err = TierError;

    /// Accepts tier names and the C enum spellings (`fast`, `normal`, `slow`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pin_fast" | "fast" => Ok(Self::PinFast),
            "hot" | "normal" => Ok(Self::Hot),
            "cold" | "slow" => Ok(Self::Cold),
            _ => Err(TierError::UnknownTier {
                tier: s.to_string(),
            }),
        }
    }
}

/// Tier capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Bounded(u64),
    Unbounded,
}

impl Capacity {
    #[must_use]
    pub const fn from_config(bytes: Option<u64>) -> Self {
        match bytes {
            Some(b) => Self::Bounded(b),
            None => Self::Unbounded,
        }
    }

    #[must_use]
    pub const fn limit(self) -> Option<u64> {
        match self {
            Self::Bounded(b) => Some(b),
            Self::Unbounded => None,
        }
    }
}

/// Bandwidth/latency model used by the throttle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    pub bandwidth_bps: f64,
    pub base_latency_ns: u64,
}

impl CostModel {
    #[must_use]
    pub const fn new(bandwidth_bps: f64, base_latency_ns: u64) -> Self {
        Self {
            bandwidth_bps,
            base_latency_ns,
        }
    }

    /// Built-in cost model of a tier.
    #[must_use]
    pub const fn default_for(id: TierId) -> Self {
        let cfg = DEFAULT_TIERS[id.index()];
        Self::new(cfg.bandwidth_bps, cfg.base_latency_ns)
    }
}

/// Immutable description of a tier, as given to the registry builder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierSpec {
    pub id: TierId,
    pub strategy: BackingStrategy,
    pub capacity: Capacity,
    pub cost: CostModel,
    pub fallback: Option<TierId>,
}

impl TierSpec {
    /// Spec with the built-in strategy, capacity, cost and fallback of `id`.
    #[must_use]
    pub const fn new(id: TierId) -> Self {
        Self::from_config(id, &DEFAULT_TIERS[id.index()])
    }

    #[must_use]
    pub const fn from_config(id: TierId, cfg: &TierConfig) -> Self {
        Self {
            id,
            strategy: id.default_strategy(),
            capacity: Capacity::from_config(cfg.capacity_bytes),
            cost: CostModel::new(cfg.bandwidth_bps, cfg.base_latency_ns),
            fallback: id.default_fallback(),
        }
    }

    #[must_use]
    pub const fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_fallback(mut self, fallback: Option<TierId>) -> Self {
        self.fallback = fallback;
        self
    }

    #[must_use]
    pub const fn with_strategy(mut self, strategy: BackingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub const fn with_cost(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }
}

/// A registered tier: its spec plus live usage.
#[derive(Debug)]
pub struct Tier {
    spec: TierSpec,
    usage: AtomicU64,
}

impl Tier {
    pub(crate) fn new(spec: TierSpec) -> Self {
        Self {
            spec,
            usage: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> TierId {
        self.spec.id
    }

    #[must_use]
    pub fn spec(&self) -> &TierSpec {
        &self.spec
    }

    #[must_use]
    pub fn strategy(&self) -> BackingStrategy {
        self.spec.strategy
    }

    #[must_use]
    pub fn capacity(&self) -> Capacity {
        self.spec.capacity
    }

    #[must_use]
    pub fn cost(&self) -> CostModel {
        self.spec.cost
    }

    #[must_use]
    pub fn fallback(&self) -> Option<TierId> {
        self.spec.fallback
    }

    /// Bytes currently reserved in this tier.
    #[must_use]
    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }

    /// Reserve `bytes` if they fit under the capacity.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        let limit = self.spec.capacity.limit();
        self.usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(bytes)?;
                match limit {
                    Some(cap) if next > cap => None,
                    _ => Some(next),
                }
            })
            .is_ok()
    }

    /// Return a reservation made by [`Tier::try_reserve`].
    pub fn release(&self, bytes: u64) {
        let _ = self
            .usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}
