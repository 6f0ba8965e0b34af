//! `malloc`/`free`/`calloc`/`realloc` interposition for `LD_PRELOAD`.
//!
//! Enable with `TA_INTERPOSE=1 LD_PRELOAD=libtieralloc_abi.so <prog>`;
//! `TA_DISABLE=1` turns routing off again at runtime. Requests of at least
//! `TA_MIN_ROUTE` bytes (default 64 KiB) are placed under the process default
//! hint; everything else, every reentrant call and every pointer without a
//! live tier record goes to glibc.

use std::ffi::c_void;

use tieralloc_core::{Handle, HandleState};
use tieralloc_membrane::runtime_config;

use crate::native;
use crate::state::{enter_allocator_reentry_guard, runtime, try_runtime};

/// Whether a request of `size` bytes should be routed to the tiers.
#[inline]
fn routes(size: usize) -> bool {
    let cfg = runtime_config();
    cfg.interposition_active() && size >= cfg.min_route
}

/// Whether `ptr` is a live tier allocation. Never builds the runtime.
#[inline]
fn owned(ptr: *mut c_void) -> bool {
    try_runtime().is_some_and(|rt| {
        matches!(
            rt.allocator().handle_state(Handle::new(ptr as usize)),
            HandleState::Live(_)
        )
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        // SAFETY: reentrant path goes straight to glibc to avoid recursion.
        return unsafe { native::malloc(size) };
    };
    if routes(size) {
        if let Some(Ok(handle)) = runtime().map(|rt| rt.allocator().allocate(size, None)) {
            return handle.addr() as *mut c_void;
        }
        // Tiers exhausted: the request is still served.
    }
    // SAFETY: plain glibc allocation.
    unsafe { native::malloc(size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        // SAFETY: reentrant path goes straight to glibc to avoid recursion.
        unsafe { native::free(ptr) };
        return;
    };
    if ptr.is_null() {
        return;
    }
    if owned(ptr) {
        if let Some(rt) = try_runtime() {
            // A concurrent free of the same pointer loses the race and is
            // logged as a double free by the allocator.
            let _ = rt.allocator().free(Handle::new(ptr as usize));
            return;
        }
    }
    // SAFETY: not a tier allocation, so it came from glibc.
    unsafe { native::free(ptr) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        // SAFETY: reentrant path goes straight to glibc to avoid recursion.
        return unsafe { native::calloc(nmemb, size) };
    };
    if let Some(total) = nmemb.checked_mul(size) {
        if routes(total) {
            if let Some(Ok(handle)) = runtime().map(|rt| rt.allocator().calloc(nmemb, size, None))
            {
                return handle.addr() as *mut c_void;
            }
        }
    }
    // SAFETY: plain glibc allocation; glibc checks the multiply itself.
    unsafe { native::calloc(nmemb, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        // SAFETY: realloc(NULL, n) == malloc(n).
        return unsafe { malloc(size) };
    }
    let Some(_reentry_guard) = enter_allocator_reentry_guard() else {
        // SAFETY: reentrant path goes straight to glibc to avoid recursion.
        return unsafe { native::realloc(ptr, size) };
    };
    if !owned(ptr) {
        // SAFETY: not a tier allocation, so it came from glibc.
        return unsafe { native::realloc(ptr, size) };
    }
    let Some(rt) = try_runtime() else {
        return std::ptr::null_mut();
    };
    let handle = Handle::new(ptr as usize);
    if size == 0 {
        let _ = rt.allocator().free(handle);
        return std::ptr::null_mut();
    }
    match rt.allocator().realloc(handle, size, None) {
        Ok(moved) => moved.addr() as *mut c_void,
        Err(_) => {
            crate::util::set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
    }
}
