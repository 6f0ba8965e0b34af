use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tieralloc_core::{
    AllocatorHooks, AllocatorOptions, Capacity, Handle, Hint, HintScope, LifecycleController,
    LifecycleState, LogLevel, TierError, TierId, TierRegistry, TierSpec, TieredAllocator,
    Transition,
};
use tieralloc_membrane::{DisablePolicy, LogicalBacking, RuntimeConfig};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Default)]
struct CountingNative {
    next: AtomicUsize,
    frees: AtomicUsize,
}

impl AllocatorHooks for CountingNative {
    fn allocate(&self, size: usize) -> Result<usize, TierError> {
        Ok(0x6000_0000_0000 + self.next.fetch_add(size.max(16), Ordering::Relaxed))
    }

    fn free(&self, _addr: usize) -> Result<(), TierError> {
        self.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn realloc(&self, _addr: usize, size: usize) -> Result<usize, TierError> {
        self.allocate(size)
    }
}

fn traced(registry: TierRegistry) -> TieredAllocator<LogicalBacking> {
    TieredAllocator::with_options(
        registry,
        LogicalBacking::new(),
        AllocatorOptions {
            log_level: LogLevel::Trace,
            ..AllocatorOptions::default()
        },
    )
}

#[test]
fn pin_fast_overflow_falls_back_to_hot() {
    let registry = TierRegistry::builder()
        .tier(TierSpec::new(TierId::PinFast).with_capacity(Capacity::Bounded(1024)))
        .tier(
            TierSpec::new(TierId::Hot)
                .with_capacity(Capacity::Unbounded)
                .with_fallback(None),
        )
        .build()
        .expect("two tier registry");
    let alloc = traced(registry);

    let handle = alloc
        .allocate(2048, Some("pin_fast".parse().expect("hint parses")))
        .expect("fallback to hot succeeds");
    assert_eq!(alloc.tier_of(handle).unwrap(), TierId::Hot);
    assert_eq!(alloc.usage(TierId::PinFast).unwrap(), 0);

    let stats = alloc.stats();
    assert_eq!(stats.fallbacks[TierId::PinFast.index()], 1);
    assert_eq!(stats.alloc_calls, [0, 1, 0]);

    let logs = alloc.drain_lifecycle_logs();
    let fallback = logs
        .iter()
        .find(|r| r.event == "fallback")
        .expect("fallback is logged");
    assert_eq!(fallback.tier, Some(TierId::Hot));
    assert!(fallback.trace_id.starts_with("tieralloc::core::allocate::"));
}

#[test]
fn exhausted_chain_reports_every_tier_tried() {
    let registry = TierRegistry::builder()
        .tier(TierSpec::new(TierId::PinFast).with_capacity(Capacity::Bounded(4096)))
        .tier(TierSpec::new(TierId::Hot).with_capacity(Capacity::Bounded(4096)))
        .tier(TierSpec::new(TierId::Cold).with_capacity(Capacity::Bounded(4096)))
        .build()
        .unwrap();
    let alloc = traced(registry);
    let err = alloc.allocate(1 << 20, Some(Hint::PinFast)).unwrap_err();
    assert_eq!(
        err,
        TierError::OutOfMemory {
            requested: 1 << 20,
            tried: vec![TierId::PinFast, TierId::Hot, TierId::Cold],
        }
    );
    assert_eq!(alloc.live_count(), 0);
    assert_eq!(alloc.stats().failures[TierId::PinFast.index()], 1);
}

#[test]
fn placement_stays_within_hint_fallback_chain() {
    let registry = TierRegistry::builder()
        .tier(TierSpec::new(TierId::PinFast).with_capacity(Capacity::Bounded(64 * 1024)))
        .tier(TierSpec::new(TierId::Hot).with_capacity(Capacity::Bounded(256 * 1024)))
        .tier(TierSpec::new(TierId::Cold))
        .build()
        .unwrap();
    let alloc = TieredAllocator::new(registry, LogicalBacking::new());
    let mut rng = XorShift64::new(0xC0FFEE);
    let mut live: Vec<(Handle, Hint)> = Vec::new();

    for step in 0..3_000 {
        if !live.is_empty() && rng.gen_range_usize(0, 2) == 0 {
            let (handle, _) = live.swap_remove(rng.gen_range_usize(0, live.len() - 1));
            alloc.free(handle).expect("live handle frees");
            continue;
        }
        let hint = Hint::ALL[rng.gen_range_usize(0, Hint::ALL.len() - 1)];
        let size = rng.gen_range_usize(0, 32 * 1024);
        let handle = alloc.allocate(size, Some(hint)).expect("cold is unbounded");
        let tier = alloc.tier_of(handle).unwrap();
        let chain: Vec<_> = alloc.registry().fallback_chain(hint.preferred_tier()).collect();
        assert!(
            chain.contains(&tier),
            "step={step}: {tier} not in chain of {hint}: {chain:?}"
        );
        live.push((handle, hint));

        for id in TierId::ALL {
            let tier = alloc.registry().resolve(id).unwrap();
            if let Some(cap) = tier.capacity().limit() {
                assert!(tier.usage() <= cap, "step={step}: {id} over capacity");
            }
        }
    }
    assert_eq!(alloc.live_count(), live.len());
}

#[test]
fn double_free_yields_invalid_handle() {
    let alloc = traced(TierRegistry::standard());
    let handle = alloc.allocate(100, Some(Hint::Hot)).unwrap();
    assert!(alloc.free(handle).is_ok());
    assert_eq!(
        alloc.free(handle),
        Err(TierError::InvalidHandle {
            handle: handle.addr()
        })
    );
    assert_eq!(alloc.stats().free_calls[TierId::Hot.index()], 1);
}

#[test]
fn default_hint_round_trip_and_nested_scopes() {
    let alloc = traced(TierRegistry::standard());
    assert_eq!(alloc.default_hint(), Hint::Warm);
    for hint in Hint::ALL {
        alloc.set_default_hint(hint);
        assert_eq!(alloc.default_hint(), hint);
    }

    alloc.set_default_hint(Hint::Cold);
    {
        let outer = alloc.hint_scope(Hint::Hot);
        assert_eq!(outer.previous(), Hint::Cold);
        {
            let inner = HintScope::enter(alloc.default_hint_cell(), Hint::PinFast);
            assert_eq!(inner.previous(), Hint::Hot);
            let handle = alloc.allocate(10, None).unwrap();
            assert_eq!(alloc.tier_of(handle).unwrap(), TierId::PinFast);
        }
        assert_eq!(alloc.default_hint(), Hint::Hot);
    }
    assert_eq!(alloc.default_hint(), Hint::Cold, "restored to the value before, not to warm");
}

#[test]
fn enable_disable_are_idempotent() {
    let allocator = Arc::new(traced(TierRegistry::standard()));
    let native = Arc::new(CountingNative::default());
    let ctl = LifecycleController::new(allocator, native, DisablePolicy::Reject);

    assert_eq!(ctl.enable(), Transition::Changed);
    assert_eq!(ctl.enable(), Transition::Unchanged);
    assert_eq!(ctl.state(), LifecycleState::Enabled);
    assert_eq!(ctl.disable(), Ok(Transition::Changed));
    assert_eq!(ctl.disable(), Ok(Transition::Unchanged));
    assert_eq!(ctl.state(), LifecycleState::Disabled);
    assert_eq!(ctl.hello(), "tieralloc-ok");
}

#[test]
fn reject_policy_disable_with_live_allocations() {
    let allocator = Arc::new(traced(TierRegistry::standard()));
    let native = Arc::new(CountingNative::default());
    let ctl = LifecycleController::new(Arc::clone(&allocator), native, DisablePolicy::Reject);
    ctl.enable();

    let a = ctl.allocate(1000).unwrap();
    let b = ctl.allocate(2000).unwrap();
    assert_eq!(
        ctl.disable(),
        Err(TierError::AllocationsStillLive { live: 2 })
    );
    assert_eq!(ctl.state(), LifecycleState::Enabled);
    assert!(
        allocator
            .drain_lifecycle_logs()
            .iter()
            .any(|r| r.event == "disable_rejected" && r.level == LogLevel::Warn)
    );

    ctl.free(a).unwrap();
    ctl.free(b).unwrap();
    assert_eq!(ctl.disable(), Ok(Transition::Changed));
}

#[test]
fn drain_policy_leaves_no_records_and_no_usage() {
    let allocator = Arc::new(traced(TierRegistry::standard()));
    let native = Arc::new(CountingNative::default());
    let ctl = LifecycleController::new(
        Arc::clone(&allocator),
        Arc::clone(&native) as Arc<dyn AllocatorHooks>,
        DisablePolicy::Drain,
    );
    ctl.enable();

    let mut ptrs = Vec::new();
    for hint in [Hint::PinFast, Hint::Hot, Hint::Cold, Hint::Warm] {
        let _scope = allocator.hint_scope(hint);
        ptrs.push(ctl.allocate(3000).unwrap());
    }
    assert_eq!(ctl.disable(), Ok(Transition::Changed));
    assert_eq!(allocator.live_count(), 0);
    for id in TierId::ALL {
        assert_eq!(allocator.usage(id).unwrap(), 0, "{id}");
    }
    assert_eq!(allocator.stats().detached.iter().sum::<u64>(), 4);

    for ptr in ptrs {
        ctl.free(ptr).unwrap();
    }
    assert_eq!(native.frees.load(Ordering::Relaxed), 4);
}

#[test]
fn env_config_builds_a_matching_allocator() {
    let cfg = RuntimeConfig::from_lookup(|key| match key {
        "TA_CAP_FAST" => Some("8k".to_string()),
        "TA_DEFAULT_HINT" => Some("cold".to_string()),
        "TA_LOG_LEVEL" => Some("debug".to_string()),
        "TA_DISABLE_POLICY" => Some("drain".to_string()),
        _ => None,
    });
    assert_eq!(cfg.disable_policy, DisablePolicy::Drain);
    let alloc = TieredAllocator::from_config(&cfg, LogicalBacking::new()).unwrap();
    assert_eq!(alloc.default_hint(), Hint::Cold);
    assert_eq!(alloc.lifecycle_log().min_level(), LogLevel::Debug);

    let first = alloc.allocate(8192, Some(Hint::PinFast)).unwrap();
    let second = alloc.allocate(8192, Some(Hint::PinFast)).unwrap();
    assert_eq!(alloc.tier_of(first).unwrap(), TierId::PinFast);
    assert_eq!(alloc.tier_of(second).unwrap(), TierId::Hot);
}

#[test]
fn stats_json_exposes_per_tier_arrays() {
    let alloc = traced(TierRegistry::standard());
    let h = alloc.allocate(4096, Some(Hint::Cold)).unwrap();
    alloc.free(h).unwrap();
    let json = alloc.stats().to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["alloc_calls"], serde_json::json!([0, 0, 1]));
    assert_eq!(value["free_calls"], serde_json::json!([0, 0, 1]));
    assert_eq!(value["bytes_current"], serde_json::json!([0, 0, 0]));
    assert_eq!(value["bytes_total_freed"], serde_json::json!([0, 0, 4096]));
}
