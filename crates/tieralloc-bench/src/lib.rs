//! Shared fixtures for the tieralloc benchmarks.

use tieralloc_core::{AllocatorOptions, LogLevel, TierRegistry, TieredAllocator};
use tieralloc_membrane::TierBacking;

/// Allocator with logging reduced to errors so the ring stays out of the
/// measured path.
pub fn quiet_allocator<B: TierBacking>(registry: TierRegistry, backing: B) -> TieredAllocator<B> {
    TieredAllocator::with_options(
        registry,
        backing,
        AllocatorOptions {
            log_level: LogLevel::Error,
            ..AllocatorOptions::default()
        },
    )
}

/// Deterministic request sizes in `[min, max]`.
#[derive(Debug, Clone)]
pub struct SizeSequence {
    state: u64,
    min: usize,
    span: usize,
}

impl SizeSequence {
    #[must_use]
    pub fn new(seed: u64, min: usize, max: usize) -> Self {
        Self {
            state: seed | 1,
            min,
            span: max.saturating_sub(min) + 1,
        }
    }
}

impl Iterator for SizeSequence {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        Some(self.min + (x as usize) % self.span)
    }
}
