//! Tooling around the tiered allocator.
//!
//! This crate provides:
//! - Workloads: deterministic allocation patterns (mixed tiers, rolling demotion)
//! - Structured logs: JSONL export of the allocator's lifecycle records
//! - `tierallocctl`: CLI for probing configuration and running workloads

#![forbid(unsafe_code)]

pub mod error;
pub mod structured_log;
pub mod workload;

pub use error::HarnessError;
pub use structured_log::{LogEmitter, LogEntry};
pub use workload::{WorkloadConfig, WorkloadKind, WorkloadReport, run_workload};
