//! Native allocator access.
//!
//! Binds glibc's internal entry points directly so that calls made from
//! inside this library never land on an interposed `malloc` again.

use std::ffi::c_void;
use tieralloc_core::{AllocatorHooks, TierError};

unsafe extern "C" {
    #[link_name = "__libc_malloc"]
    fn native_libc_malloc_sym(size: usize) -> *mut c_void;
    #[link_name = "__libc_calloc"]
    fn native_libc_calloc_sym(nmemb: usize, size: usize) -> *mut c_void;
    #[link_name = "__libc_realloc"]
    fn native_libc_realloc_sym(ptr: *mut c_void, size: usize) -> *mut c_void;
    #[link_name = "__libc_free"]
    fn native_libc_free_sym(ptr: *mut c_void);
}

#[inline]
pub(crate) unsafe fn malloc(size: usize) -> *mut c_void {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_malloc_sym(size) }
}

#[inline]
#[cfg_attr(not(feature = "interpose"), allow(dead_code))]
pub(crate) unsafe fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_calloc_sym(nmemb, size) }
}

#[inline]
pub(crate) unsafe fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_realloc_sym(ptr, size) }
}

#[inline]
pub(crate) unsafe fn free(ptr: *mut c_void) {
    // SAFETY: direct call to libc allocator symbol.
    unsafe { native_libc_free_sym(ptr) }
}

/// The host's own allocator, as seen by the lifecycle controller.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LibcHooks;

impl AllocatorHooks for LibcHooks {
    fn allocate(&self, size: usize) -> Result<usize, TierError> {
        // SAFETY: plain libc allocation.
        let ptr = unsafe { malloc(size.max(1)) };
        if ptr.is_null() {
            return Err(TierError::OutOfMemory {
                requested: size,
                tried: Vec::new(),
            });
        }
        Ok(ptr as usize)
    }

    fn free(&self, addr: usize) -> Result<(), TierError> {
        // SAFETY: the controller only forwards addresses it does not own,
        // which the host obtained from the native allocator.
        unsafe { free(addr as *mut c_void) };
        Ok(())
    }

    fn realloc(&self, addr: usize, size: usize) -> Result<usize, TierError> {
        // SAFETY: as for `free`.
        let ptr = unsafe { realloc(addr as *mut c_void, size.max(1)) };
        if ptr.is_null() {
            return Err(TierError::OutOfMemory {
                requested: size,
                tried: Vec::new(),
            });
        }
        Ok(ptr as usize)
    }
}
