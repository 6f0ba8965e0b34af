//! Shared internal utilities for ABI adapters.

use std::ffi::{CStr, c_char, c_int};
use tieralloc_core::TierError;

/// Store `code` in the calling thread's `errno`.
#[inline]
pub(crate) fn set_errno(code: c_int) {
    // SAFETY: __errno_location returns a valid thread-local pointer.
    unsafe { *libc::__errno_location() = code };
}

/// Report `err` through `errno` and return the negated code.
#[inline]
pub(crate) fn fail(err: &TierError) -> c_int {
    let code = err.errno();
    set_errno(code);
    -code
}

/// Borrow a NUL-terminated UTF-8 string, `None` for null or invalid UTF-8.
///
/// # Safety
///
/// A non-null `ptr` must point to a NUL-terminated string that outlives `'a`.
pub(crate) unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: caller guarantees a valid C string.
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}
