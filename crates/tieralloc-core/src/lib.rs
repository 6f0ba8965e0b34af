//! # tieralloc-core
//!
//! Safe policy layer of the tiered allocator.
//!
//! Requests carry an optional [`Hint`]; the [`HintResolver`] turns the
//! call-scoped hint, the process-wide default hint and the system default into
//! a [`TierId`], and the [`TieredAllocator`] places the request in that tier,
//! walking the tier's fallback chain when it is full. Raw memory comes from a
//! [`tieralloc_membrane::TierBacking`], so no `unsafe` code is permitted here.
//!
//! The [`LifecycleController`] gates host allocation hooks between this
//! allocator and the native one.

#![deny(unsafe_code)]

pub mod allocator;
pub mod error;
pub mod hint;
pub mod lifecycle;
pub mod log;
pub mod records;
pub mod resolver;
pub mod stats;
pub mod throttle;
pub mod tier;

pub use allocator::{AllocatorOptions, TieredAllocator};
pub use error::TierError;
pub use hint::{Hint, HintCell, HintScope};
pub use lifecycle::{AllocatorHooks, HELLO, LifecycleController, LifecycleState, Transition};
pub use log::{AllocatorLogRecord, LifecycleLog, LogLevel};
pub use records::{AllocationRecord, Handle, HandleState};
pub use resolver::{HintResolver, HintSource, Resolution, SYSTEM_DEFAULT_HINT};
pub use stats::StatsSnapshot;
pub use tier::registry::{TierRegistry, TierRegistryBuilder};
pub use tier::{Capacity, CostModel, Tier, TierId, TierSpec};
