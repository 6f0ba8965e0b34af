//! Workload runs end to end, with their lifecycle records exported as JSONL.

use std::path::PathBuf;

use tieralloc_core::{
    AllocatorOptions, Capacity, LogLevel, TierError, TierId, TierRegistry, TierSpec,
    TieredAllocator,
};
use tieralloc_harness::structured_log::{LogEmitter, validate_log_file};
use tieralloc_harness::{HarnessError, WorkloadConfig, run_workload};
use tieralloc_membrane::{LogicalBacking, SystemArena, TierBacking};

fn traced<B: TierBacking>(registry: TierRegistry, backing: B) -> TieredAllocator<B> {
    TieredAllocator::with_options(
        registry,
        backing,
        AllocatorOptions {
            log_level: LogLevel::Debug,
            ..AllocatorOptions::default()
        },
    )
}

fn temp_log(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("tieralloc-{name}-{}.jsonl", std::process::id()))
}

#[test]
fn roll_demotes_one_block_per_step_once_the_window_is_full() {
    let alloc = traced(TierRegistry::standard(), LogicalBacking::new());
    let report = run_workload(&alloc, &WorkloadConfig::roll()).unwrap();

    assert_eq!(report.allocations, 80);
    assert_eq!(report.moves, 8, "steps 2..=9 each demote the oldest block");
    assert_eq!(report.frees, 80);
    assert_eq!(report.peak_live, 80);
    assert_eq!(report.placed, [0, 72, 8]);
    assert_eq!(report.steps.len(), 10);
    assert_eq!(report.steps[1].stats.alloc_calls[TierId::Cold.index()], 0);
    assert_eq!(report.steps[2].stats.alloc_calls[TierId::Cold.index()], 1);
    assert!(report.final_stats.simulated_wait_ns[TierId::Cold.index()] > 0);
    assert_eq!(alloc.live_count(), 0);

    let moves = alloc
        .drain_lifecycle_logs()
        .into_iter()
        .filter(|r| r.event == "move")
        .count();
    assert_eq!(moves, 8);
}

#[test]
fn failed_demotion_releases_the_whole_window() {
    let registry = TierRegistry::builder()
        .tier(TierSpec::new(TierId::Hot))
        .tier(TierSpec::new(TierId::Cold).with_capacity(Capacity::Bounded(4096)))
        .build()
        .unwrap();
    let alloc = traced(registry, LogicalBacking::new());

    let err = run_workload(&alloc, &WorkloadConfig::roll()).unwrap_err();
    assert!(matches!(
        err,
        HarnessError::Allocator(TierError::OutOfMemory { .. })
    ));
    assert_eq!(alloc.live_count(), 0);
    assert_eq!(alloc.usage(TierId::Hot).unwrap(), 0);
    assert_eq!(alloc.usage(TierId::Cold).unwrap(), 0);
}

#[test]
fn mixed_run_on_real_memory_exports_a_valid_log() {
    let alloc = traced(TierRegistry::standard(), SystemArena::new(false));
    let config = WorkloadConfig {
        block_size: 64 * 1024,
        blocks: 12,
        ..WorkloadConfig::mixed()
    };
    let report = run_workload(&alloc, &config).unwrap();
    assert_eq!(report.placed, [0, 8, 4]);
    assert_eq!(alloc.backing().live_blocks(), 0);

    let path = temp_log("mixed");
    let mut emitter = LogEmitter::to_file(&path, "mixed").unwrap();
    let records = alloc.drain_lifecycle_logs();
    let written = emitter.emit_records(&records).unwrap();
    emitter.flush().unwrap();
    drop(emitter);

    let (lines, errors) = validate_log_file(&path).unwrap();
    let _ = std::fs::remove_file(&path);
    assert_eq!(lines, written);
    assert!(errors.is_empty(), "{:?}", errors.iter().map(ToString::to_string).collect::<Vec<_>>());
}

#[test]
fn fallback_is_visible_in_the_exported_log() {
    let registry = TierRegistry::builder()
        .tier(TierSpec::new(TierId::PinFast).with_capacity(Capacity::Bounded(8192)))
        .tier(TierSpec::new(TierId::Hot))
        .tier(TierSpec::new(TierId::Cold))
        .build()
        .unwrap();
    let alloc = traced(registry, LogicalBacking::new());
    let a = alloc.allocate(8192, Some(tieralloc_core::Hint::PinFast)).unwrap();
    let b = alloc.allocate(1024, Some(tieralloc_core::Hint::PinFast)).unwrap();
    assert_eq!(alloc.tier_of(a).unwrap(), TierId::PinFast);
    assert_eq!(alloc.tier_of(b).unwrap(), TierId::Hot);

    let mut emitter = LogEmitter::to_buffer("fallback");
    emitter.emit_records(&alloc.drain_lifecycle_logs()).unwrap();
    let text = String::from_utf8(emitter.into_inner()).unwrap();
    let fallback: serde_json::Value = text
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .find(|v| v["event"] == "fallback")
        .expect("fallback record");
    assert_eq!(fallback["tier"], "hot");
    assert_eq!(fallback["level"], "info");
    assert_eq!(fallback["symbol"], "allocate");
}
