//! Enable/disable gate between host allocation hooks and the tiered
//! allocator.
//!
//! New allocations follow the gate: enabled routes to the tiered allocator,
//! disabled to the native one. Frees and reallocs follow ownership instead:
//! a pointer with a live tier record is handled by the tiered allocator
//! whatever the gate says, anything else goes native. Released tier memory
//! returns to the native heap, which may hand the same address out again, so
//! a recently freed tier address is not evidence of tier ownership; such
//! frees are forwarded native with a WARN `double_free_suspected` record.
//!
//! Tier-routed hook calls hold the gate's read side from the state check
//! until their record is in place; transitions take the write side, so
//! `disable` never observes an allocation half way through.

use crate::allocator::TieredAllocator;
use crate::error::TierError;
use crate::log::{LogFields, LogLevel};
use crate::records::{Handle, HandleState};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tieralloc_membrane::{DisablePolicy, TierBacking};

/// Greeting returned by `hello`, in any state.
pub const HELLO: &str = "tieralloc-ok";

/// Allocation capability set a host installs: allocate, free, realloc.
///
/// Addresses are plain `usize`; `0` is the null pointer.
pub trait AllocatorHooks: Send + Sync {
    fn allocate(&self, size: usize) -> Result<usize, TierError>;
    fn free(&self, addr: usize) -> Result<(), TierError>;
    fn realloc(&self, addr: usize, size: usize) -> Result<usize, TierError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    Disabled = 0,
    Enabled = 1,
}

impl LifecycleState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
        }
    }

    const fn from_raw(raw: u8) -> Self {
        if raw == Self::Enabled as u8 {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

/// Outcome of an idempotent transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed,
    Unchanged,
}

pub struct LifecycleController<B: TierBacking> {
    allocator: Arc<TieredAllocator<B>>,
    native: Arc<dyn AllocatorHooks>,
    policy: DisablePolicy,
    state: AtomicU8,
    gate: RwLock<()>,
}

impl<B: TierBacking> LifecycleController<B> {
    /// Controller starting in the disabled state.
    pub fn new(
        allocator: Arc<TieredAllocator<B>>,
        native: Arc<dyn AllocatorHooks>,
        policy: DisablePolicy,
    ) -> Self {
        Self {
            allocator,
            native,
            policy,
            state: AtomicU8::new(LifecycleState::Disabled as u8),
            gate: RwLock::new(()),
        }
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<TieredAllocator<B>> {
        &self.allocator
    }

    #[must_use]
    pub fn policy(&self) -> DisablePolicy {
        self.policy
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state() == LifecycleState::Enabled
    }

    #[must_use]
    pub fn hello(&self) -> &'static str {
        HELLO
    }

    /// Route host allocations through the tiered allocator.
    pub fn enable(&self) -> Transition {
        let _guard = self.gate.write();
        let previous = self
            .state
            .swap(LifecycleState::Enabled as u8, Ordering::AcqRel);
        let transition = if previous == LifecycleState::Enabled as u8 {
            Transition::Unchanged
        } else {
            Transition::Changed
        };
        self.log_transition("enable", transition);
        transition
    }

    /// Route host allocations back to the native allocator.
    ///
    /// Under [`DisablePolicy::Reject`] this fails while allocations are live
    /// and the controller stays enabled. Under [`DisablePolicy::Drain`] every
    /// live allocation is detached and left to the native heap.
    ///
    /// Waits for tier-routed hook calls already in progress to finish.
    pub fn disable(&self) -> Result<Transition, TierError> {
        let _guard = self.gate.write();
        if self.state() == LifecycleState::Disabled {
            self.log_transition("disable", Transition::Unchanged);
            return Ok(Transition::Unchanged);
        }

        self.state
            .store(LifecycleState::Disabled as u8, Ordering::Release);

        match self.policy {
            DisablePolicy::Reject => {
                let live = self.allocator.live_count();
                if live > 0 {
                    self.state
                        .store(LifecycleState::Enabled as u8, Ordering::Release);
                    self.allocator.log(
                        LogLevel::Warn,
                        LogFields::new("disable", "disable_rejected", "still_live"),
                        || format!("live={live} policy=reject"),
                    );
                    return Err(TierError::AllocationsStillLive { live });
                }
            }
            DisablePolicy::Drain => {
                let drained = self.allocator.drain_live();
                self.allocator.log(
                    LogLevel::Info,
                    LogFields::new("disable", "drain", "detached"),
                    || format!("drained={drained} policy=drain"),
                );
            }
        }

        self.log_transition("disable", Transition::Changed);
        Ok(Transition::Changed)
    }

    fn log_transition(&self, symbol: &'static str, transition: Transition) {
        let (level, outcome) = match transition {
            Transition::Changed => (LogLevel::Info, "changed"),
            Transition::Unchanged => (LogLevel::Debug, "unchanged"),
        };
        self.allocator.log(
            level,
            LogFields::new(symbol, "lifecycle_transition", outcome),
            || format!("state={} policy={}", self.state().as_str(), self.policy.as_str()),
        );
    }

    fn warn_if_recently_freed(&self, symbol: &'static str, addr: usize, state: HandleState) {
        if state == HandleState::RecentlyFreed {
            self.allocator.log(
                LogLevel::Warn,
                LogFields::new(symbol, "double_free_suspected", "forwarded_native").handle(addr),
                || "address was released by a tier".to_string(),
            );
        }
    }
}

impl<B: TierBacking> AllocatorHooks for LifecycleController<B> {
    fn allocate(&self, size: usize) -> Result<usize, TierError> {
        {
            let _gate = self.gate.read();
            if self.is_enabled() {
                return AllocatorHooks::allocate(self.allocator.as_ref(), size);
            }
        }
        self.native.allocate(size.max(1))
    }

    fn free(&self, addr: usize) -> Result<(), TierError> {
        if addr == 0 {
            return Ok(());
        }
        let state = {
            let _gate = self.gate.read();
            match self.allocator.handle_state(Handle::new(addr)) {
                HandleState::Live(_) => return self.allocator.free(Handle::new(addr)),
                other => other,
            }
        };
        self.warn_if_recently_freed("free", addr, state);
        self.native.free(addr)
    }

    fn realloc(&self, addr: usize, size: usize) -> Result<usize, TierError> {
        if addr == 0 {
            return AllocatorHooks::allocate(self, size);
        }
        let state = {
            let _gate = self.gate.read();
            match self.allocator.handle_state(Handle::new(addr)) {
                HandleState::Live(_) => {
                    return self
                        .allocator
                        .realloc(Handle::new(addr), size, None)
                        .map(Handle::addr);
                }
                other => other,
            }
        };
        self.warn_if_recently_freed("realloc", addr, state);
        self.native.realloc(addr, size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocatorOptions;
    use crate::tier::registry::TierRegistry;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tieralloc_membrane::{BackingStrategy, BlockMeta, LogicalBacking};

    /// Native heap stand-in handing out addresses far from the logical range.
    #[derive(Default)]
    struct FakeNative {
        next: AtomicUsize,
        frees: AtomicUsize,
    }

    impl AllocatorHooks for FakeNative {
        fn allocate(&self, size: usize) -> Result<usize, TierError> {
            Ok(0x7000_0000_0000 + self.next.fetch_add(size.max(16), Ordering::Relaxed))
        }

        fn free(&self, _addr: usize) -> Result<(), TierError> {
            self.frees.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn realloc(&self, _addr: usize, size: usize) -> Result<usize, TierError> {
            self.allocate(size)
        }
    }

    fn controller(
        policy: DisablePolicy,
    ) -> (LifecycleController<LogicalBacking>, Arc<FakeNative>) {
        let allocator = Arc::new(TieredAllocator::with_options(
            TierRegistry::standard(),
            LogicalBacking::new(),
            AllocatorOptions {
                log_level: LogLevel::Debug,
                ..AllocatorOptions::default()
            },
        ));
        let native = Arc::new(FakeNative::default());
        let ctl = LifecycleController::new(allocator, native.clone(), policy);
        (ctl, native)
    }

    #[test]
    fn transitions_are_idempotent() {
        let (ctl, _) = controller(DisablePolicy::Reject);
        assert_eq!(ctl.state(), LifecycleState::Disabled);
        assert_eq!(ctl.disable().unwrap(), Transition::Unchanged);
        assert_eq!(ctl.enable(), Transition::Changed);
        assert_eq!(ctl.enable(), Transition::Unchanged);
        assert!(ctl.is_enabled());
        assert_eq!(ctl.disable().unwrap(), Transition::Changed);
        assert_eq!(ctl.disable().unwrap(), Transition::Unchanged);
        assert_eq!(ctl.hello(), "tieralloc-ok");
    }

    #[test]
    fn hooks_route_by_state_and_ownership() {
        let (ctl, native) = controller(DisablePolicy::Reject);
        let native_ptr = ctl.allocate(64).unwrap();
        assert_eq!(ctl.allocator().live_count(), 0);

        ctl.enable();
        let tier_ptr = ctl.allocate(64).unwrap();
        assert_eq!(ctl.allocator().live_count(), 1);

        ctl.free(native_ptr).unwrap();
        assert_eq!(native.frees.load(Ordering::Relaxed), 1);

        let grown = ctl.realloc(tier_ptr, 4096).unwrap();
        ctl.free(grown).unwrap();
        assert_eq!(ctl.allocator().live_count(), 0);
        assert_eq!(native.frees.load(Ordering::Relaxed), 1);

        // A released tier address belongs to whoever reissues it.
        ctl.allocator().drain_lifecycle_logs();
        ctl.free(grown).unwrap();
        assert_eq!(native.frees.load(Ordering::Relaxed), 2);
        let suspected: Vec<_> = ctl
            .allocator()
            .drain_lifecycle_logs()
            .into_iter()
            .filter(|r| r.event == "double_free_suspected")
            .collect();
        assert_eq!(suspected.len(), 1);
        assert_eq!(suspected[0].level, LogLevel::Warn);
        assert_eq!(suspected[0].handle, Some(grown));
        assert!(matches!(
            ctl.allocator().free(Handle::new(grown)),
            Err(TierError::InvalidHandle { .. })
        ));
        ctl.free(0).unwrap();
    }

    #[test]
    fn reject_policy_keeps_hooks_installed() {
        let (ctl, _) = controller(DisablePolicy::Reject);
        ctl.enable();
        let ptr = ctl.allocate(128).unwrap();
        assert_eq!(
            ctl.disable(),
            Err(TierError::AllocationsStillLive { live: 1 })
        );
        assert!(ctl.is_enabled());
        ctl.free(ptr).unwrap();
        assert_eq!(ctl.disable().unwrap(), Transition::Changed);
    }

    #[test]
    fn drain_policy_hands_blocks_to_native() {
        let (ctl, native) = controller(DisablePolicy::Drain);
        ctl.enable();
        let ptrs: Vec<_> = (0..4).map(|_| ctl.allocate(1 << 16).unwrap()).collect();
        assert_eq!(ctl.disable().unwrap(), Transition::Changed);
        assert_eq!(ctl.allocator().live_count(), 0);
        assert_eq!(ctl.allocator().usage(crate::tier::TierId::Hot).unwrap(), 0);
        for ptr in ptrs {
            ctl.free(ptr).unwrap();
        }
        assert_eq!(native.frees.load(Ordering::Relaxed), 4);
    }

    /// Logical backing whose `acquire` stalls once armed, announcing entry.
    #[derive(Default)]
    struct StallingBacking {
        inner: LogicalBacking,
        armed: AtomicBool,
        entered: AtomicBool,
    }

    impl TierBacking for StallingBacking {
        fn footprint(&self, strategy: BackingStrategy, size: usize) -> Option<usize> {
            self.inner.footprint(strategy, size)
        }

        fn acquire(&self, strategy: BackingStrategy, size: usize) -> Option<usize> {
            if self.armed.load(Ordering::Acquire) {
                self.entered.store(true, Ordering::Release);
                std::thread::sleep(Duration::from_millis(50));
            }
            self.inner.acquire(strategy, size)
        }

        fn release(&self, addr: usize) -> bool {
            self.inner.release(addr)
        }

        fn detach(&self, addr: usize) -> bool {
            self.inner.detach(addr)
        }

        fn copy(&self, src: usize, dst: usize, len: usize) -> bool {
            self.inner.copy(src, dst, len)
        }

        fn zero(&self, addr: usize, len: usize) -> bool {
            self.inner.zero(addr, len)
        }

        fn block(&self, addr: usize) -> Option<BlockMeta> {
            self.inner.block(addr)
        }

        fn live_blocks(&self) -> usize {
            self.inner.live_blocks()
        }
    }

    fn stalling_controller(policy: DisablePolicy) -> Arc<LifecycleController<StallingBacking>> {
        let allocator = Arc::new(TieredAllocator::new(
            TierRegistry::standard(),
            StallingBacking::default(),
        ));
        Arc::new(LifecycleController::new(
            allocator,
            Arc::new(FakeNative::default()),
            policy,
        ))
    }

    /// Start `op` on another thread and return once it is stalled inside
    /// the backing.
    fn stall_in_backing<F>(
        ctl: &Arc<LifecycleController<StallingBacking>>,
        op: F,
    ) -> std::thread::JoinHandle<usize>
    where
        F: FnOnce(&LifecycleController<StallingBacking>) -> usize + Send + 'static,
    {
        let backing = ctl.allocator().backing();
        backing.entered.store(false, Ordering::Release);
        backing.armed.store(true, Ordering::Release);
        let worker = {
            let ctl = Arc::clone(ctl);
            std::thread::spawn(move || op(&ctl))
        };
        while !ctl.allocator().backing().entered.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        worker
    }

    #[test]
    fn reject_disable_waits_for_allocation_in_flight() {
        let ctl = stalling_controller(DisablePolicy::Reject);
        ctl.enable();
        let worker = stall_in_backing(&ctl, |ctl| ctl.allocate(64).unwrap());

        assert_eq!(
            ctl.disable(),
            Err(TierError::AllocationsStillLive { live: 1 })
        );
        assert!(ctl.is_enabled());
        let ptr = worker.join().unwrap();

        ctl.allocator().backing().armed.store(false, Ordering::Release);
        ctl.free(ptr).unwrap();
        assert_eq!(ctl.disable().unwrap(), Transition::Changed);
    }

    #[test]
    fn reject_disable_sees_block_being_reallocated() {
        let ctl = stalling_controller(DisablePolicy::Reject);
        ctl.enable();
        let ptr = ctl.allocate(64).unwrap();
        let worker = stall_in_backing(&ctl, move |ctl| ctl.realloc(ptr, 1 << 20).unwrap());

        assert_eq!(
            ctl.disable(),
            Err(TierError::AllocationsStillLive { live: 1 })
        );
        let grown = worker.join().unwrap();
        assert_eq!(ctl.allocator().live_count(), 1);

        ctl.allocator().backing().armed.store(false, Ordering::Release);
        ctl.free(grown).unwrap();
        assert_eq!(ctl.disable().unwrap(), Transition::Changed);
    }

    #[test]
    fn drain_disable_covers_allocation_in_flight() {
        let ctl = stalling_controller(DisablePolicy::Drain);
        ctl.enable();
        let worker = stall_in_backing(&ctl, |ctl| ctl.allocate(64).unwrap());

        assert_eq!(ctl.disable().unwrap(), Transition::Changed);
        let ptr = worker.join().unwrap();
        assert_ne!(ptr, 0);
        assert_eq!(ctl.allocator().live_count(), 0);
        assert_eq!(ctl.allocator().usage(crate::tier::TierId::Hot).unwrap(), 0);
        assert_eq!(ctl.allocator().backing().live_blocks(), 0);
    }
}
