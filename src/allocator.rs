//! Top-level allocator: ties all tiers together and implements `GlobalAlloc`.
//!
//! `ThreadCacheAlloc` is zero-sized; all mutable state lives in module-level
//! statics protected by spinlocks or atomics.
//!
//! Thread-local binding strategy (fastest to slowest), exactly one compiled
//! in per build:
//! - `nightly` feature: `#[thread_local]` with const-init (single TLS read, no branches)
//! - `std` feature: `std::thread_local!`, flushed on thread exit by a `Drop` guard
//! - neither: no thread cache at all, every allocation crosses the bucket lock

use crate::PAGE_SHIFT;
use crate::PAGE_SIZE;
use crate::central_cache::CentralCache;
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class;
use crate::span;
use crate::sync::SpinMutex;
use crate::{hist_record, stat_add, stat_inc};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

#[cfg(any(feature = "nightly", feature = "std"))]
use crate::thread_cache::ThreadCache;

pub(crate) static PAGE_MAP: PageMap = PageMap::new();
pub(crate) static PAGE_HEAP: SpinMutex<PageHeap> = SpinMutex::new(PageHeap::new(&PAGE_MAP));
pub(crate) static CENTRAL_CACHE: CentralCache = CentralCache::new();

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[derive(Clone, Copy, PartialEq)]
        #[repr(u8)]
        enum TlsState {
            Uninitialized = 0,
            Active = 1,
            Destroyed = 2,
        }

        struct TlsSlot<T> {
            state: TlsState,
            content: T,
        }

        #[inline(always)]
        unsafe fn tc() -> *mut ThreadCache {
            unsafe { core::ptr::addr_of_mut!(TC.content) }
        }

        #[thread_local]
        static mut TC: TlsSlot<ThreadCache> = TlsSlot {
            state: TlsState::Uninitialized,
            content: ThreadCache::new(),
        };

        #[cold]
        #[allow(dead_code)]
        unsafe fn tc_destroy() {
            unsafe {
                if TC.state == TlsState::Active {
                    TC.state = TlsState::Destroyed;
                    (*tc()).flush_and_destroy(&CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP);
                }
            }
        }

        #[cold]
        #[inline(never)]
        unsafe fn tc_init() {
            // Set BEFORE cleanup registration: if registration triggers a
            // reentrant allocation, that call sees TC as Active already.
            unsafe { TC.state = TlsState::Active };
            tc_cleanup::register();
        }

        #[cfg(feature = "std")]
        mod tc_cleanup {
            struct Guard;

            impl Drop for Guard {
                fn drop(&mut self) {
                    if unsafe { super::TC.state } == super::TlsState::Active {
                        unsafe { super::tc_destroy() };
                    }
                }
            }

            std::thread_local! {
                static GUARD: Guard = const { Guard };
            }

            pub(super) fn register() {
                // If std's TLS is already torn down (thread shutdown edge
                // case), skip silently — the thread cache leaks.
                let _ = GUARD.try_with(|_| {});
            }
        }

        #[cfg(not(feature = "std"))]
        mod tc_cleanup {
            pub(super) fn register() {}
        }
    } else if #[cfg(feature = "std")] {
        std::thread_local! {
            static TC_CELL: core::cell::UnsafeCell<ThreadCache> = const {
                core::cell::UnsafeCell::new(ThreadCache::new())
            };
        }
    }
}

/// tcmalloc-style allocator for Rust.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: tcrsmalloc::ThreadCacheAlloc = tcrsmalloc::ThreadCacheAlloc;
/// ```
pub struct ThreadCacheAlloc;

unsafe impl GlobalAlloc for ThreadCacheAlloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }

        stat_inc!(alloc_count);
        stat_add!(alloc_bytes, size as u64);
        hist_record!(size);

        let align = layout.align();

        if align <= 8 {
            if let Some(class) = size_class::index(size) {
                return unsafe { self.alloc_small(class) };
            }
        } else {
            let effective_size = size.max(align);
            if let Some(class) = size_class::index(effective_size) {
                let class_size = size_class::class_to_size(class);
                if align > PAGE_SIZE || class_size % align != 0 {
                    return unsafe { self.alloc_large(layout) };
                }
                return unsafe { self.alloc_small(class) };
            }
        }

        unsafe { self.alloc_large(layout) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }

        stat_inc!(dealloc_count);

        // Never trust layout.size(): a prior realloc may have returned the
        // same pointer for an in-place shrink, leaving the caller holding a
        // layout smaller than the span's real size class. Re-derive from
        // span metadata instead.
        let page_id = (ptr as usize) >> PAGE_SHIFT;
        let span = PAGE_MAP.get(page_id);
        if span.is_null() {
            return;
        }

        let obj_size = unsafe { (*span).object_size };
        if obj_size != 0 {
            let class = size_class::index(obj_size).expect("span object_size must map to a class");
            unsafe { self.dealloc_small(ptr, class) };
        } else {
            unsafe { PAGE_HEAP.lock().deallocate_span(span) };
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() && layout.size() > 0 {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() || layout.size() == 0 {
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            return unsafe { self.alloc(new_layout) };
        }

        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return layout.align() as *mut u8;
        }

        stat_inc!(realloc_count);

        // Again, never trust layout.size() — re-derive the real usable size
        // from span metadata.
        let page_id = (ptr as usize) >> PAGE_SHIFT;
        let span = PAGE_MAP.get(page_id);
        let old_usable = if !span.is_null() {
            let obj_size = unsafe { (*span).object_size };
            if obj_size != 0 {
                obj_size
            } else {
                (unsafe { (*span).page_count }) * PAGE_SIZE
            }
        } else {
            layout.size()
        };

        if new_size <= old_usable {
            return ptr;
        }

        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size)) };
            unsafe { self.dealloc(ptr, layout) };
        }
        new_ptr
    }
}

impl ThreadCacheAlloc {
    cfg_if::cfg_if! {
        if #[cfg(feature = "nightly")] {
            #[inline(always)]
            unsafe fn alloc_small(&self, class: usize) -> *mut u8 {
                if unsafe { TC.state } == TlsState::Active {
                    return unsafe { (*tc()).allocate(class, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP) };
                }
                unsafe { self.alloc_small_slow(class) }
            }

            #[cold]
            #[inline(never)]
            unsafe fn alloc_small_slow(&self, class: usize) -> *mut u8 {
                if unsafe { TC.state } == TlsState::Uninitialized {
                    unsafe { tc_init() };
                    return unsafe { (*tc()).allocate(class, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP) };
                }
                unsafe { self.alloc_from_central(class) }
            }

            #[inline(always)]
            unsafe fn dealloc_small(&self, ptr: *mut u8, class: usize) {
                if unsafe { TC.state } == TlsState::Active {
                    unsafe { (*tc()).deallocate(ptr, class, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP) };
                    return;
                }
                unsafe { self.dealloc_to_central(ptr, class) };
            }
        } else if #[cfg(feature = "std")] {
            #[inline(always)]
            unsafe fn alloc_small(&self, class: usize) -> *mut u8 {
                match TC_CELL.try_with(|cell| unsafe {
                    let tc = &mut *cell.get();
                    tc.allocate(class, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP)
                }) {
                    Ok(ptr) => ptr,
                    Err(_) => unsafe { self.alloc_from_central(class) },
                }
            }

            #[inline(always)]
            unsafe fn dealloc_small(&self, ptr: *mut u8, class: usize) {
                if TC_CELL
                    .try_with(|cell| unsafe {
                        let tc = &mut *cell.get();
                        tc.deallocate(ptr, class, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP);
                    })
                    .is_err()
                {
                    unsafe { self.dealloc_to_central(ptr, class) };
                }
            }
        } else {
            #[inline(always)]
            unsafe fn alloc_small(&self, class: usize) -> *mut u8 {
                unsafe { self.alloc_from_central(class) }
            }

            #[inline(always)]
            unsafe fn dealloc_small(&self, ptr: *mut u8, class: usize) {
                unsafe { self.dealloc_to_central(ptr, class) };
            }
        }
    }

    // Both TLS strategies (and the no-TLS fallback above) route through the
    // lock-dropping variants: the bucket lock must never be held across the
    // page-heap lock (see `central_cache::remove_range_dropping_lock`).
    unsafe fn alloc_from_central(&self, class: usize) -> *mut u8 {
        stat_inc!(thread_cache_misses);
        stat_inc!(central_cache_hits);
        let (count, head) = unsafe {
            crate::central_cache::remove_range_dropping_lock(
                CENTRAL_CACHE.get(class), class, 1, &PAGE_HEAP, &PAGE_MAP,
            )
        };
        if count == 0 || head.is_null() {
            ptr::null_mut()
        } else {
            head as *mut u8
        }
    }

    unsafe fn dealloc_to_central(&self, ptr: *mut u8, class: usize) {
        use crate::span::FreeObject;
        let obj = ptr as *mut FreeObject;
        unsafe { (*obj).next = ptr::null_mut() };
        unsafe {
            crate::central_cache::insert_range_dropping_lock(
                CENTRAL_CACHE.get(class), obj, 1, &PAGE_HEAP, &PAGE_MAP,
            )
        };
    }

    unsafe fn alloc_large(&self, layout: Layout) -> *mut u8 {
        stat_inc!(page_heap_allocs);

        let size = layout.size();
        let align = layout.align();
        let size_pages = size.div_ceil(PAGE_SIZE);

        if align <= PAGE_SIZE {
            let span = unsafe { PAGE_HEAP.lock().allocate_span(size_pages) };
            if span.is_null() {
                return ptr::null_mut();
            }
            unsafe {
                (*span).object_size = 0;
                PAGE_MAP.register_span(span);
            }
            return unsafe { (*span).start_addr() };
        }

        // Over-aligned: over-allocate and trim the prefix/suffix through the
        // page heap so the middle region lands on the requested alignment.
        let align_pages = align / PAGE_SIZE;
        let total_pages = size_pages + align_pages - 1;

        let mut heap = PAGE_HEAP.lock();
        let span = unsafe { heap.allocate_span(total_pages) };
        if span.is_null() {
            return ptr::null_mut();
        }

        let start_addr = unsafe { (*span).start_addr() } as usize;
        let aligned_addr = (start_addr + align - 1) & !(align - 1);
        let prefix_pages = (aligned_addr - start_addr) / PAGE_SIZE;
        let suffix_pages = total_pages - prefix_pages - size_pages;

        unsafe {
            PAGE_MAP.unregister_span(span);

            if prefix_pages > 0 {
                let prefix = span::alloc_span();
                if !prefix.is_null() {
                    (*prefix).start = (*span).start;
                    (*prefix).page_count = prefix_pages;
                    heap.deallocate_span(prefix);
                }
            }

            (*span).start += prefix_pages;
            (*span).page_count = size_pages;
            (*span).object_size = 0;
            PAGE_MAP.register_span(span);

            if suffix_pages > 0 {
                let suffix = span::alloc_span();
                if !suffix.is_null() {
                    (*suffix).start = (*span).start + size_pages;
                    (*suffix).page_count = suffix_pages;
                    heap.deallocate_span(suffix);
                }
            }
        }

        aligned_addr as *mut u8
    }
}

#[cfg(feature = "nightly")]
unsafe impl core::alloc::Allocator for ThreadCacheAlloc {
    fn allocate(
        &self,
        layout: Layout,
    ) -> Result<core::ptr::NonNull<[u8]>, core::alloc::AllocError> {
        let ptr = unsafe { GlobalAlloc::alloc(self, layout) };
        if ptr.is_null() {
            Err(core::alloc::AllocError)
        } else {
            let slice = core::ptr::slice_from_raw_parts_mut(ptr, layout.size());
            Ok(unsafe { core::ptr::NonNull::new_unchecked(slice) })
        }
    }

    unsafe fn deallocate(&self, ptr: core::ptr::NonNull<u8>, layout: Layout) {
        unsafe { GlobalAlloc::dealloc(self, ptr.as_ptr(), layout) }
    }
}
