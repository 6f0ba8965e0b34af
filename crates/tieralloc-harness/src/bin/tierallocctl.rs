//! CLI entrypoint for tieralloc tooling.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tieralloc_core::{HELLO, Hint, HintResolver, TierRegistry, TieredAllocator};
use tieralloc_harness::structured_log::{LogEmitter, LogEntry, LogLevel};
use tieralloc_harness::{WorkloadConfig, WorkloadKind, run_workload};
use tieralloc_membrane::config::parse_byte_size;
use tieralloc_membrane::{LogicalBacking, RuntimeConfig, SystemArena, TierBacking};

/// Inspect and exercise the tiered allocator.
#[derive(Debug, Parser)]
#[command(name = "tierallocctl")]
#[command(about = "Configuration probe and workload runner for tieralloc")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backing {
    /// Bookkeeping only: addresses without memory.
    Logical,
    /// Real memory from the native heap.
    System,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the liveness string.
    Hello,
    /// Print the stats of a freshly configured allocator as JSON.
    Stats,
    /// Print the configuration resolved from the environment.
    Config,
    /// Show which tier a hint resolves to.
    Resolve {
        /// Call-scoped hint.
        #[arg(long)]
        hint: Option<String>,
        /// Process default hint (defaults to TA_DEFAULT_HINT, then `warm`).
        #[arg(long)]
        default: Option<String>,
    },
    /// Run a deterministic workload and print its report.
    Run {
        #[arg(long, value_enum, default_value = "mixed")]
        workload: WorkloadKind,
        #[arg(long, value_enum, default_value = "logical")]
        backing: Backing,
        /// Block size (`k`/`m`/`g` suffixes accepted).
        #[arg(long)]
        block_size: Option<String>,
        /// Blocks (mixed) or blocks per step (roll).
        #[arg(long)]
        blocks: Option<usize>,
        /// Steps (roll).
        #[arg(long)]
        steps: Option<usize>,
        /// Write allocator lifecycle records as JSONL.
        #[arg(long)]
        log: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = RuntimeConfig::from_env();
    for issue in &config.issues {
        eprintln!("warning: {issue}");
    }

    match cli.command.unwrap_or(Command::Hello) {
        Command::Hello => {
            println!("{HELLO}");
        }
        Command::Stats => {
            let alloc = TieredAllocator::from_config(&config, LogicalBacking::new())?;
            println!("{}", alloc.stats().to_json()?);
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config_json(&config))?);
        }
        Command::Resolve { hint, default } => {
            let registry = TierRegistry::from_config(&config)?;
            let call = hint.as_deref().map(str::parse::<Hint>).transpose()?;
            let global = default
                .as_deref()
                .or(config.default_hint.as_deref())
                .map(str::parse::<Hint>)
                .transpose()?;
            let resolution = HintResolver::new(&registry).resolve_hint(call, global)?;
            let chain: Vec<_> = registry
                .fallback_chain(resolution.tier)
                .map(|tier| tier.as_str())
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "hint": resolution.hint,
                    "tier": resolution.tier,
                    "source": resolution.source.as_str(),
                    "fallback_chain": chain,
                })
            );
        }
        Command::Run {
            workload,
            backing,
            block_size,
            blocks,
            steps,
            log,
        } => {
            let mut workload_config = match workload {
                WorkloadKind::Mixed => WorkloadConfig::mixed(),
                WorkloadKind::Roll => WorkloadConfig::roll(),
            };
            if let Some(raw) = block_size {
                let size = parse_byte_size(&raw)
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| format!("invalid --block-size `{raw}`"))?;
                workload_config.block_size = size;
            }
            if let Some(blocks) = blocks {
                workload_config.blocks = blocks;
            }
            if let Some(steps) = steps {
                workload_config.steps = steps;
            }

            match backing {
                Backing::Logical => {
                    run(&config, LogicalBacking::new(), &workload_config, log)?;
                }
                Backing::System => {
                    run(&config, SystemArena::new(config.pin_fast), &workload_config, log)?;
                }
            }
        }
    }
    Ok(())
}

fn run<B: TierBacking>(
    config: &RuntimeConfig,
    backing: B,
    workload: &WorkloadConfig,
    log: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let alloc = TieredAllocator::from_config(config, backing)?;
    let result = run_workload(&alloc, workload);

    if let Some(path) = log {
        let run_id = format!("{:?}", workload.kind).to_lowercase();
        let mut emitter = LogEmitter::to_file(&path, &run_id)?;
        emitter.emit(LogLevel::Info, "run_start")?;
        let written = emitter.emit_records(&alloc.drain_lifecycle_logs())?;
        let end = LogEntry::new(String::new(), LogLevel::Info, "run_end")
            .with_outcome(if result.is_ok() { "success" } else { "failed" })
            .with_stats(&alloc.stats())?;
        emitter.emit_entry(end)?;
        emitter.flush()?;
        eprintln!(
            "wrote {written} allocator records (+{} dropped) to {}",
            alloc.lifecycle_log().dropped(),
            path.display()
        );
    }

    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn config_json(config: &RuntimeConfig) -> serde_json::Value {
    let tiers: Vec<_> = ["fast", "normal", "slow"]
        .iter()
        .zip(config.tiers.iter())
        .map(|(name, tier)| {
            serde_json::json!({
                "tier": name,
                "capacity_bytes": tier.capacity_bytes,
                "bandwidth_bps": tier.bandwidth_bps,
                "base_latency_ns": tier.base_latency_ns,
            })
        })
        .collect();
    serde_json::json!({
        "interpose": config.interpose,
        "disabled": config.disabled,
        "interposition_active": config.interposition_active(),
        "default_hint": config.default_hint,
        "min_route": config.min_route,
        "disable_policy": config.disable_policy.as_str(),
        "pin_fast": config.pin_fast,
        "log_level": config.log_level.as_str(),
        "tiers": tiers,
        "issues": config.issues.iter().map(ToString::to_string).collect::<Vec<_>>(),
    })
}
