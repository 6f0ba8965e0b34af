//! Memory substrate for tieralloc.
//!
//! This crate owns everything that touches raw memory or the process
//! environment, so the policy layer in `tieralloc-core` can stay free of
//! `unsafe`:
//! - **Configuration** (`config`): environment-driven tier table and switches,
//!   resolved once through a non-blocking atomic cache
//! - **Arenas** (`arena`): backing strategies that hand out tier memory and
//!   refuse to act on addresses they did not produce

pub mod arena;
pub mod config;

pub use arena::{BackingStrategy, BlockMeta, BlockTable, LogicalBacking, SystemArena, TierBacking};
pub use config::{
    ConfigError, DisablePolicy, LogLevel, RuntimeConfig, TierConfig, runtime_config,
};
