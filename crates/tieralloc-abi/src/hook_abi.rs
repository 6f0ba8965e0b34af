//! Host allocation hooks.
//!
//! A host (e.g. a framework's pluggable allocator) installs these three entry
//! points once. While tieralloc is enabled new allocations are placed in the
//! tiers under the current default hint; while disabled they go to the native
//! allocator. Frees and reallocs follow the pointer's owner either way.
//! Failure is null with `errno = ENOMEM`, never a zero-size success.

use std::ffi::c_void;

use tieralloc_core::AllocatorHooks;
use tieralloc_core::error::errno;

use crate::native::{self, LibcHooks};
use crate::state::with_runtime;
use crate::util::set_errno;

fn to_ptr(result: Result<usize, tieralloc_core::TierError>) -> *mut c_void {
    match result {
        Ok(addr) => addr as *mut c_void,
        Err(err) => {
            set_errno(match err.errno() {
                errno::EINVAL => errno::EINVAL,
                _ => errno::ENOMEM,
            });
            std::ptr::null_mut()
        }
    }
}

abi_fn! {
    /// Allocate `size` bytes for the host.
    fn ta_hook_allocate(size: usize) -> *mut c_void {
        let result = with_runtime(|rt| rt.controller.allocate(size))
            .unwrap_or_else(|| LibcHooks.allocate(size));
        to_ptr(result)
    }
}

abi_fn! {
    /// Release a pointer obtained from [`ta_hook_allocate`] or
    /// [`ta_hook_realloc`]. Null is ignored.
    fn ta_hook_free(ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        match with_runtime(|rt| rt.controller.free(ptr as usize)) {
            Some(Ok(())) => {}
            Some(Err(err)) => set_errno(err.errno()),
            None => native::free(ptr),
        }
    }
}

abi_fn! {
    /// Resize a host allocation. A null `ptr` allocates.
    fn ta_hook_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        let result = with_runtime(|rt| rt.controller.realloc(ptr as usize, size))
            .unwrap_or_else(|| LibcHooks.realloc(ptr as usize, size));
        to_ptr(result)
    }
}
