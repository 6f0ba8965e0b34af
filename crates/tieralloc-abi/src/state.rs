//! Process-wide allocator runtime behind the ABI.
//!
//! Built on first use from [`runtime_config`] and leaked for the life of the
//! process. Entry points reach it through [`with_runtime`], which also marks
//! the calling thread as inside the allocator so that any `malloc`/`free`
//! issued on its behalf (backing memory, log buffers, record shards) goes
//! straight to the native heap when interposition is compiled in.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering as AtomicOrdering};

use tieralloc_core::{
    AllocatorOptions, LifecycleController, LogLevel, TierRegistry, TieredAllocator,
};
use tieralloc_membrane::{RuntimeConfig, SystemArena, runtime_config};

use crate::native::LibcHooks;

pub(crate) struct Runtime {
    pub(crate) controller: LifecycleController<SystemArena>,
    pub(crate) config: &'static RuntimeConfig,
}

impl Runtime {
    fn build(config: &'static RuntimeConfig) -> Self {
        let allocator = match TieredAllocator::from_config(config, SystemArena::new(config.pin_fast))
        {
            Ok(allocator) => allocator,
            Err(err) => {
                // Unusable tier table: keep serving with the built-in one.
                let allocator = TieredAllocator::with_options(
                    TierRegistry::standard(),
                    SystemArena::new(config.pin_fast),
                    AllocatorOptions {
                        log_level: config.log_level,
                        ..AllocatorOptions::default()
                    },
                );
                allocator.lifecycle_log().record(
                    LogLevel::Error,
                    tieralloc_core::log::LogFields::new("init", "registry_rejected", "defaults"),
                    0,
                    || err.to_string(),
                );
                allocator
            }
        };
        Self {
            controller: LifecycleController::new(
                Arc::new(allocator),
                Arc::new(LibcHooks),
                config.disable_policy,
            ),
            config,
        }
    }

    #[inline]
    pub(crate) fn allocator(&self) -> &TieredAllocator<SystemArena> {
        self.controller.allocator()
    }
}

// Runtime lifecycle states.
const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

// UNINIT -> INITIALIZING -> READY without OnceLock: a reentrant call from the
// initializing thread (its own allocations may come back through an
// interposed malloc) sees INITIALIZING and gets None instead of a futex wait.
static RUNTIME_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static RUNTIME_PTR: AtomicPtr<Runtime> = AtomicPtr::new(std::ptr::null_mut());

/// Get the runtime, building it on first call.
///
/// `None` while another call is still building it.
pub(crate) fn runtime() -> Option<&'static Runtime> {
    let state = RUNTIME_STATE.load(AtomicOrdering::Acquire);
    if state == STATE_READY {
        return try_runtime();
    }
    if state == STATE_INITIALIZING {
        return None;
    }

    if RUNTIME_STATE
        .compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            AtomicOrdering::SeqCst,
            AtomicOrdering::Relaxed,
        )
        .is_err()
    {
        return try_runtime();
    }

    let ptr = Box::into_raw(Box::new(Runtime::build(runtime_config())));
    RUNTIME_PTR.store(ptr, AtomicOrdering::Release);
    RUNTIME_STATE.store(STATE_READY, AtomicOrdering::Release);
    // SAFETY: just published; the box is leaked and never freed.
    Some(unsafe { &*ptr })
}

/// Get the runtime only if it has already been built.
pub(crate) fn try_runtime() -> Option<&'static Runtime> {
    if RUNTIME_STATE.load(AtomicOrdering::Acquire) != STATE_READY {
        return None;
    }
    let ptr = RUNTIME_PTR.load(AtomicOrdering::Acquire);
    // SAFETY: once READY, RUNTIME_PTR is valid and never changes.
    unsafe { ptr.as_ref() }
}

// ---------------------------------------------------------------------------
// Reentrancy guard
// ---------------------------------------------------------------------------

thread_local! {
    static ALLOCATOR_REENTRY_DEPTH: Cell<u32> = const { Cell::new(0) };
}

pub(crate) struct AllocatorReentryGuard;

impl Drop for AllocatorReentryGuard {
    fn drop(&mut self) {
        let _ = ALLOCATOR_REENTRY_DEPTH.try_with(|depth| {
            let current = depth.get();
            depth.set(current.saturating_sub(1));
        });
    }
}

/// Mark this thread as inside the allocator. `None` if it already is, or
/// if its thread-local storage is gone (thread teardown).
#[inline]
pub(crate) fn enter_allocator_reentry_guard() -> Option<AllocatorReentryGuard> {
    ALLOCATOR_REENTRY_DEPTH
        .try_with(|depth| {
            let current = depth.get();
            if current > 0 {
                None
            } else {
                depth.set(current + 1);
                Some(AllocatorReentryGuard)
            }
        })
        .ok()
        .flatten()
}

/// Run `f` against the runtime with the reentry guard held.
///
/// `None` when the runtime is unavailable (still initializing) or the thread
/// is already inside the allocator.
#[inline]
pub(crate) fn with_runtime<R>(f: impl FnOnce(&'static Runtime) -> R) -> Option<R> {
    let _guard = enter_allocator_reentry_guard()?;
    runtime().map(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentry_guard_is_exclusive_per_thread() {
        let outer = enter_allocator_reentry_guard();
        assert!(outer.is_some());
        assert!(enter_allocator_reentry_guard().is_none());
        assert!(with_runtime(|_| ()).is_none(), "nested entry is refused");
        drop(outer);

        let again = enter_allocator_reentry_guard();
        assert!(again.is_some());
        std::thread::spawn(|| assert!(enter_allocator_reentry_guard().is_some()))
            .join()
            .unwrap();
    }
}
