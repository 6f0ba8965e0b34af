// All extern "C" ABI exports accept raw pointers from C callers and check them
// at runtime, so per-function safety docs would be redundant boilerplate.
#![allow(clippy::missing_safety_doc)]
//! # tieralloc-abi
//!
//! `extern "C"` boundary of the tiered allocator.
//!
//! ```text
//! C caller / host hook -> ABI entry (this crate) -> LifecycleController -> TieredAllocator
//!                                                 \-> native allocator (disabled / foreign)
//! ```
//!
//! Errors become return codes and `errno` here and nowhere else. The
//! `interpose` feature additionally exports `malloc`, `free`, `calloc` and
//! `realloc` for `LD_PRELOAD` use.

#[macro_use]
mod macros;

mod native;
mod state;
mod util;

pub mod hook_abi;
pub mod tieralloc_abi;

// Exports malloc/free/calloc/realloc; never linked into test binaries, where
// they would shadow the system allocator.
#[cfg(all(feature = "interpose", not(test)))]
pub mod interpose_abi;

pub use crate::tieralloc_abi::{TA_HINT_KEEP, ta_charge_info_t, ta_stats_snapshot_t};
