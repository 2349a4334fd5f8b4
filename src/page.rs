//! Page-level memory primitives
//!
//! The cache acquires backing memory in page-aligned, page-multiple blocks
//! and returns it wholesale. Nothing in this module knows about slabs.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Host page size, queried once and cached.
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf has no memory-safety preconditions.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as usize
        } else {
            4096
        }
    })
}

/// Allocate `size` bytes aligned to the page size.
///
/// `size` must be a non-zero multiple of the page size.
pub(crate) fn alloc_pages(size: usize) -> Result<NonNull<u8>> {
    debug_assert!(size > 0 && size % page_size() == 0);
    let layout = page_layout(size);
    // SAFETY: the layout has non-zero size.
    let ptr = unsafe { alloc(layout) };
    NonNull::new(ptr).ok_or(Error::OutOfMemory { requested: size })
}

/// Release a block obtained from [`alloc_pages`].
///
/// # Safety
///
/// `ptr` must have been returned by `alloc_pages(size)` with the same
/// `size`, and must not be used afterwards.
pub(crate) unsafe fn free_pages(ptr: NonNull<u8>, size: usize) {
    // SAFETY: the caller guarantees the pointer/layout pairing.
    unsafe { dealloc(ptr.as_ptr(), page_layout(size)) };
}

fn page_layout(size: usize) -> Layout {
    // The page size is a power of two, so this cannot fail for any size the
    // cache requests.
    Layout::from_size_align(size, page_size()).expect("page-aligned layout")
}
