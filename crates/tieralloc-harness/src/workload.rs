//! Deterministic allocation workloads.
//!
//! `mixed` places blocks round-robin under `hot`, `warm` and `cold`, frees
//! every other one, then the rest. `roll` keeps a sliding window of hot
//! blocks and demotes the oldest to the cold tier once the window is twice
//! the batch size, snapshotting stats after every step.

use crate::error::HarnessError;
use serde::Serialize;
use tieralloc_core::{Handle, Hint, StatsSnapshot, TierId, TieredAllocator};
use tieralloc_membrane::TierBacking;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Mixed,
    Roll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadConfig {
    pub kind: WorkloadKind,
    /// Block size in bytes.
    pub block_size: usize,
    /// `mixed`: total blocks. `roll`: blocks allocated per step.
    pub blocks: usize,
    /// `roll` only.
    pub steps: usize,
}

impl WorkloadConfig {
    /// 64 blocks of 16 MiB across the three hints.
    #[must_use]
    pub const fn mixed() -> Self {
        Self {
            kind: WorkloadKind::Mixed,
            block_size: 16 << 20,
            blocks: 64,
            steps: 1,
        }
    }

    /// 10 steps of 8 hot blocks of 8 MiB.
    #[must_use]
    pub const fn roll() -> Self {
        Self {
            kind: WorkloadKind::Roll,
            block_size: 8 << 20,
            blocks: 8,
            steps: 10,
        }
    }

    fn validate(&self) -> Result<(), HarnessError> {
        if self.block_size == 0 || self.blocks == 0 || self.steps == 0 {
            return Err(HarnessError::Workload(format!(
                "block_size, blocks and steps must be non-zero: {self:?}"
            )));
        }
        Ok(())
    }
}

/// Stats captured at one point of a run.
#[derive(Debug, Clone, Serialize)]
pub struct StepStats {
    pub label: String,
    pub live: usize,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub kind: WorkloadKind,
    pub allocations: u64,
    pub frees: u64,
    pub moves: u64,
    pub peak_live: usize,
    /// Blocks per tier at peak residency, indexed by tier value.
    pub placed: [u64; TierId::COUNT],
    pub steps: Vec<StepStats>,
    pub final_stats: StatsSnapshot,
}

struct Run<'a, B: TierBacking> {
    alloc: &'a TieredAllocator<B>,
    allocations: u64,
    frees: u64,
    moves: u64,
    peak_live: usize,
    placed: [u64; TierId::COUNT],
    steps: Vec<StepStats>,
}

impl<'a, B: TierBacking> Run<'a, B> {
    fn new(alloc: &'a TieredAllocator<B>) -> Self {
        Self {
            alloc,
            allocations: 0,
            frees: 0,
            moves: 0,
            peak_live: 0,
            placed: [0; TierId::COUNT],
            steps: Vec::new(),
        }
    }

    fn allocate(&mut self, size: usize, hint: Hint) -> Result<Handle, HarnessError> {
        let handle = self.alloc.allocate(size, Some(hint))?;
        self.allocations += 1;
        self.peak_live = self.peak_live.max(self.alloc.live_count());
        Ok(handle)
    }

    fn free(&mut self, handle: Handle) -> Result<(), HarnessError> {
        self.alloc.free(handle)?;
        self.frees += 1;
        Ok(())
    }

    fn count_placement(&mut self, live: &[Handle]) -> Result<(), HarnessError> {
        let mut placed = [0; TierId::COUNT];
        for handle in live {
            placed[self.alloc.tier_of(*handle)?.index()] += 1;
        }
        self.placed = placed;
        Ok(())
    }

    fn snapshot(&mut self, label: String) {
        self.steps.push(StepStats {
            label,
            live: self.alloc.live_count(),
            stats: self.alloc.stats(),
        });
    }

    fn finish(self, kind: WorkloadKind) -> WorkloadReport {
        WorkloadReport {
            kind,
            allocations: self.allocations,
            frees: self.frees,
            moves: self.moves,
            peak_live: self.peak_live,
            placed: self.placed,
            steps: self.steps,
            final_stats: self.alloc.stats(),
        }
    }
}

/// Run a workload to completion. Every block it allocates is freed again,
/// also when the run fails part way.
pub fn run_workload<B: TierBacking>(
    alloc: &TieredAllocator<B>,
    config: &WorkloadConfig,
) -> Result<WorkloadReport, HarnessError> {
    config.validate()?;
    let mut run = Run::new(alloc);
    let mut live = Vec::new();
    let result = match config.kind {
        WorkloadKind::Mixed => mixed(&mut run, config, &mut live),
        WorkloadKind::Roll => roll(&mut run, config, &mut live),
    };
    if let Err(err) = result {
        for handle in live.drain(..) {
            let _ = alloc.free(handle);
        }
        return Err(err);
    }
    Ok(run.finish(config.kind))
}

fn mixed<B: TierBacking>(
    run: &mut Run<'_, B>,
    config: &WorkloadConfig,
    live: &mut Vec<Handle>,
) -> Result<(), HarnessError> {
    const HINTS: [Hint; 3] = [Hint::Hot, Hint::Warm, Hint::Cold];
    for i in 0..config.blocks {
        let handle = run.allocate(config.block_size, HINTS[i % HINTS.len()])?;
        live.push(handle);
    }
    run.count_placement(live)?;

    // Free the even blocks, keep the odd ones live for the snapshot.
    let mut idx = 0;
    while idx < live.len() {
        let handle = live.remove(idx);
        if let Err(err) = run.free(handle) {
            live.insert(idx, handle);
            return Err(err);
        }
        idx += 1;
    }
    run.snapshot("half_freed".to_string());

    while let Some(handle) = live.pop() {
        run.free(handle)?;
    }
    run.snapshot("all_freed".to_string());
    Ok(())
}

fn roll<B: TierBacking>(
    run: &mut Run<'_, B>,
    config: &WorkloadConfig,
    window: &mut Vec<Handle>,
) -> Result<(), HarnessError> {
    for step in 0..config.steps {
        for _ in 0..config.blocks {
            let handle = run.allocate(config.block_size, Hint::Hot)?;
            window.push(handle);
        }

        if window.len() > config.blocks * 2 {
            let oldest = window.remove(0);
            match run.alloc.move_to(oldest, TierId::Cold) {
                Ok(moved) => {
                    run.moves += 1;
                    window.push(moved);
                }
                Err(err) => {
                    window.push(oldest);
                    return Err(err.into());
                }
            }
        }
        run.snapshot(format!("step={step}"));
    }
    run.count_placement(window)?;

    while let Some(handle) = window.pop() {
        run.free(handle)?;
    }
    Ok(())
}
