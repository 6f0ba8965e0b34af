//! `ta_*` library surface.
//!
//! Pointers are allocation handles; tiers and hints use the `ta_tier_t` /
//! `ta_hint_t` integer values from `include/tieralloc.h`. Pointer-returning
//! calls report failure as null plus `errno`; integer-returning calls return
//! `0` or a negated errno.

use std::ffi::{c_char, c_int, c_long, c_ulonglong, c_void};

use tieralloc_core::error::errno;
use tieralloc_core::{Handle, Hint, SYSTEM_DEFAULT_HINT, TierError, TierId};

use crate::state::{Runtime, with_runtime};
use crate::util::{c_str, fail, set_errno};

/// `ta_realloc` hint value that keeps the allocation's recorded tier.
pub const TA_HINT_KEEP: c_int = -1;

/// Accumulated simulated wait, filled by [`ta_charge_bytes`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub struct ta_charge_info_t {
    pub simulated_wait_ns: c_long,
}

/// Per-tier counters, indexed by `ta_tier_t`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub struct ta_stats_snapshot_t {
    pub alloc_calls: [c_ulonglong; 3],
    pub free_calls: [c_ulonglong; 3],
    pub bytes_current: [c_ulonglong; 3],
    pub bytes_total_alloc: [c_ulonglong; 3],
    pub bytes_total_freed: [c_ulonglong; 3],
    pub simulated_wait_ns: [c_ulonglong; 3],
}

/// Result for calls made while the runtime is still being built.
fn unavailable() -> c_int {
    set_errno(libc::EAGAIN);
    -libc::EAGAIN
}

fn tier_from_raw(raw: c_int) -> Result<TierId, TierError> {
    usize::try_from(raw)
        .ok()
        .and_then(TierId::from_index)
        .ok_or_else(|| TierError::UnknownTier {
            tier: raw.to_string(),
        })
}

/// Run an allocating call, mapping errors to null + errno.
fn alloc_result(
    f: impl FnOnce(&'static Runtime) -> Result<Handle, TierError>,
) -> *mut c_void {
    match with_runtime(f) {
        Some(Ok(handle)) => handle.addr() as *mut c_void,
        Some(Err(err)) => {
            set_errno(err.errno());
            std::ptr::null_mut()
        }
        None => {
            set_errno(errno::ENOMEM);
            std::ptr::null_mut()
        }
    }
}

fn status(result: Option<Result<(), TierError>>) -> c_int {
    match result {
        Some(Ok(())) => 0,
        Some(Err(err)) => fail(&err),
        None => unavailable(),
    }
}

// -- lifecycle ---------------------------------------------------------------

/// Liveness probe; valid in every state and before initialization.
#[unsafe(no_mangle)]
pub extern "C" fn ta_hello() -> *const c_char {
    c"tieralloc-ok".as_ptr()
}

/// Build the runtime from the environment now instead of on first use.
#[unsafe(no_mangle)]
pub extern "C" fn ta_init_from_env() {
    let _ = with_runtime(|_| ());
}

#[unsafe(no_mangle)]
pub extern "C" fn ta_enable() -> c_int {
    status(with_runtime(|rt| {
        rt.controller.enable();
        Ok(())
    }))
}

/// `-EBUSY` under the reject policy while allocations are live.
#[unsafe(no_mangle)]
pub extern "C" fn ta_disable() -> c_int {
    status(with_runtime(|rt| rt.controller.disable().map(|_| ())))
}

#[unsafe(no_mangle)]
pub extern "C" fn ta_is_enabled() -> c_int {
    with_runtime(|rt| c_int::from(rt.controller.is_enabled())).unwrap_or(0)
}

// -- default hint ------------------------------------------------------------

/// `TA_HINT_DEFAULT` (0) restores the system default.
#[unsafe(no_mangle)]
pub extern "C" fn ta_set_default_hint(hint: c_int) -> c_int {
    status(with_runtime(|rt| {
        rt.allocator()
            .set_default_hint_raw(i64::from(hint))
            .map(|_| ())
    }))
}

/// Set the default hint by name (`hot`, `warm`, `cold`, `pin_fast`,
/// `prefer_fast`). Unknown names leave it unchanged and return `-EINVAL`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ta_set_default_hint_str(name: *const c_char) -> c_int {
    // SAFETY: caller passes a NUL-terminated string or null.
    let Some(name) = (unsafe { c_str(name) }) else {
        set_errno(errno::EINVAL);
        return -errno::EINVAL;
    };
    status(with_runtime(|rt| {
        rt.allocator().set_default_hint_str(name).map(|_| ())
    }))
}

/// Current default hint. While the runtime is unavailable this reports the
/// system default and sets `errno = EAGAIN`.
#[unsafe(no_mangle)]
pub extern "C" fn ta_get_default_hint() -> c_int {
    let hint = match with_runtime(|rt| rt.allocator().default_hint()) {
        Some(hint) => hint,
        None => {
            set_errno(libc::EAGAIN);
            SYSTEM_DEFAULT_HINT
        }
    };
    c_int::from(hint.as_raw())
}

/// Install `hint` as the default and return the value it replaced, for a
/// later [`ta_hint_scope_exit`]. Negative errno if `hint` is invalid.
#[unsafe(no_mangle)]
pub extern "C" fn ta_hint_scope_enter(hint: c_int) -> c_int {
    let hint = match Hint::from_raw(i64::from(hint)) {
        Ok(hint) => hint.unwrap_or(SYSTEM_DEFAULT_HINT),
        Err(err) => return fail(&err),
    };
    match with_runtime(|rt| rt.allocator().default_hint_cell().replace(hint)) {
        Some(previous) => c_int::from(previous.as_raw()),
        None => unavailable(),
    }
}

/// Restore the value returned by the matching [`ta_hint_scope_enter`].
#[unsafe(no_mangle)]
pub extern "C" fn ta_hint_scope_exit(previous: c_int) -> c_int {
    let previous = match Hint::from_raw(i64::from(previous)) {
        Ok(hint) => hint.unwrap_or(SYSTEM_DEFAULT_HINT),
        Err(err) => return fail(&err),
    };
    status(with_runtime(|rt| {
        rt.allocator().default_hint_cell().set(previous);
        Ok(())
    }))
}

// -- allocation --------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn ta_alloc(bytes: c_ulonglong, hint: c_int) -> *mut c_void {
    alloc_result(|rt| {
        let hint = Hint::from_raw(i64::from(hint))?;
        let size = usize::try_from(bytes).map_err(|_| TierError::OutOfMemory {
            requested: usize::MAX,
            tried: Vec::new(),
        })?;
        rt.allocator().allocate(size, hint)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn ta_calloc(count: usize, size: usize, hint: c_int) -> *mut c_void {
    alloc_result(|rt| {
        let hint = Hint::from_raw(i64::from(hint))?;
        rt.allocator().calloc(count, size, hint)
    })
}

/// Resize; `TA_HINT_KEEP` keeps the recorded tier, any other hint places the
/// new block where it resolves. A null `ptr` allocates.
#[unsafe(no_mangle)]
pub extern "C" fn ta_realloc(ptr: *mut c_void, bytes: c_ulonglong, hint: c_int) -> *mut c_void {
    if ptr.is_null() {
        return ta_alloc(bytes, if hint == TA_HINT_KEEP { 0 } else { hint });
    }
    alloc_result(|rt| {
        let allocator = rt.allocator();
        let hint = if hint == TA_HINT_KEEP {
            None
        } else {
            Some(Hint::from_raw(i64::from(hint))?.unwrap_or_else(|| allocator.default_hint()))
        };
        let size = usize::try_from(bytes).map_err(|_| TierError::OutOfMemory {
            requested: usize::MAX,
            tried: Vec::new(),
        })?;
        allocator.realloc(Handle::new(ptr as usize), size, hint)
    })
}

/// `0` on success (and for null), `-EINVAL` for pointers without a live
/// record, which are left alone.
#[unsafe(no_mangle)]
pub extern "C" fn ta_free(ptr: *mut c_void) -> c_int {
    if ptr.is_null() {
        return 0;
    }
    status(with_runtime(|rt| rt.allocator().free(Handle::new(ptr as usize))))
}

/// `0` and `*out` set on success, `-1` for null arguments, `-2` if `ptr`
/// is not a live allocation.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ta_tier_of(ptr: *const c_void, out: *mut c_int) -> c_int {
    if ptr.is_null() || out.is_null() {
        return -1;
    }
    match with_runtime(|rt| rt.allocator().tier_of(Handle::new(ptr as usize))) {
        Some(Ok(tier)) => {
            // SAFETY: caller guarantees `out` is writable.
            unsafe { *out = tier.index() as c_int };
            0
        }
        _ => -2,
    }
}

/// Advisory; validates the pointer and hint, otherwise no effect.
#[unsafe(no_mangle)]
pub extern "C" fn ta_advise(ptr: *mut c_void, hint: c_int) -> c_int {
    status(with_runtime(|rt| {
        let hint = Hint::from_raw(i64::from(hint))?.unwrap_or_else(|| rt.allocator().default_hint());
        rt.allocator().advise(Handle::new(ptr as usize), hint)
    }))
}

/// Throttled migration to `tier`. On success `ptr` is invalid; on failure
/// it is untouched and null is returned.
#[unsafe(no_mangle)]
pub extern "C" fn ta_move(ptr: *mut c_void, tier: c_int) -> *mut c_void {
    alloc_result(|rt| {
        let tier = tier_from_raw(tier)?;
        rt.allocator().move_to(Handle::new(ptr as usize), tier)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn ta_live_allocations() -> c_ulonglong {
    with_runtime(|rt| rt.allocator().live_count() as c_ulonglong).unwrap_or(0)
}

// -- stats & throttle --------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ta_get_stats(out: *mut ta_stats_snapshot_t) {
    if out.is_null() {
        return;
    }
    let snap = with_runtime(|rt| rt.allocator().stats()).unwrap_or_default();
    let stats = ta_stats_snapshot_t {
        alloc_calls: snap.alloc_calls,
        free_calls: snap.free_calls,
        bytes_current: snap.bytes_current,
        bytes_total_alloc: snap.bytes_total_alloc,
        bytes_total_freed: snap.bytes_total_freed,
        simulated_wait_ns: snap.simulated_wait_ns,
    };
    // SAFETY: caller guarantees `out` is writable.
    unsafe { out.write(stats) };
}

/// Write the stats JSON into `buf` with `snprintf` semantics: at most
/// `n - 1` bytes plus a NUL, return value is the full length. A null `buf`
/// or `n == 0` only measures.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ta_stats_json(buf: *mut c_char, n: c_ulonglong) -> c_int {
    let json = match with_runtime(|rt| rt.allocator().stats().to_json()) {
        Some(Ok(json)) => json,
        Some(Err(_)) => {
            set_errno(errno::EINVAL);
            return -errno::EINVAL;
        }
        None => return unavailable(),
    };
    if !buf.is_null() && n > 0 {
        let room = usize::try_from(n - 1).unwrap_or(usize::MAX);
        let copied = json.len().min(room);
        // SAFETY: caller guarantees `buf` holds `n` bytes; copied < n.
        unsafe {
            std::ptr::copy_nonoverlapping(json.as_ptr(), buf.cast::<u8>(), copied);
            *buf.add(copied) = 0;
        }
    }
    c_int::try_from(json.len()).unwrap_or(c_int::MAX)
}

/// Charge a transfer of `bytes` against `tier`'s bandwidth model and return
/// the simulated wait in ns (also added to `info` when non-null). Negative
/// errno for an unknown tier.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ta_charge_bytes(
    tier: c_int,
    bytes: c_ulonglong,
    info: *mut ta_charge_info_t,
) -> c_long {
    let wait = match with_runtime(|rt| {
        let tier = tier_from_raw(tier)?;
        rt.allocator().charge(tier, bytes)
    }) {
        Some(Ok(wait)) => c_long::try_from(wait).unwrap_or(c_long::MAX),
        Some(Err(err)) => return c_long::from(fail(&err)),
        None => return c_long::from(unavailable()),
    };
    if !info.is_null() {
        // SAFETY: caller guarantees `info` is writable.
        unsafe {
            (*info).simulated_wait_ns = (*info).simulated_wait_ns.saturating_add(wait);
        }
    }
    wait
}
