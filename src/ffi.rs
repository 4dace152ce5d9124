//! C-ABI exports, gated behind `features = ["ffi"]`.
//!
//! With the `testing` feature, export names are prefixed by thread-local
//! strategy so a harness can link multiple build variants into one binary:
//!   - `nightly` → `tcrsmalloc_nightly_*`
//!   - `std`     → `tcrsmalloc_std_*`
//!   - neither   → `tcrsmalloc_nostd_*`
//! Without `testing`, exports plain `tcrsmalloc_*` names.

use crate::allocator::ThreadCacheAlloc;
use core::alloc::{GlobalAlloc, Layout};

static ALLOC: ThreadCacheAlloc = ThreadCacheAlloc;

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "tcrsmalloc_nightly_alloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "tcrsmalloc_std_alloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "tcrsmalloc_nostd_alloc")
)]
pub unsafe extern "C" fn tcrsmalloc_alloc(size: usize, align: usize) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.alloc(layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "tcrsmalloc_nightly_dealloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "tcrsmalloc_std_dealloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "tcrsmalloc_nostd_dealloc")
)]
pub unsafe extern "C" fn tcrsmalloc_dealloc(ptr: *mut u8, size: usize, align: usize) {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.dealloc(ptr, layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "tcrsmalloc_nightly_realloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "tcrsmalloc_std_realloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "tcrsmalloc_nostd_realloc")
)]
pub unsafe extern "C" fn tcrsmalloc_realloc(
    ptr: *mut u8,
    size: usize,
    align: usize,
    new_size: usize,
) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.realloc(ptr, layout, new_size) }
}
