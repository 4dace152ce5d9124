//! Thread Cache (front-end): per-thread free lists for lock-free allocation.
//!
//! Each thread gets its own `ThreadCache` via whichever thread-local
//! mechanism the build selects (see `allocator.rs`). The fast path (thread
//! cache hit) requires zero synchronization; refilling/draining a class
//! crosses the bucket lock in `central_cache`.

use crate::central_cache::{self, CentralCache};
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::span::FreeObject;
use crate::sync::SpinMutex;
use core::ptr;

/// Per-size-class free list within the thread cache.
struct FreeList {
    head: *mut FreeObject,
    length: u32,
    /// Grows by one each time a full batch is drawn from the central cache
    /// (slow-start); caps how many objects `release_batch` hands back at once.
    max_length: u32,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            length: 0,
            max_length: 1,
        }
    }

    #[inline]
    fn pop(&mut self) -> *mut FreeObject {
        let obj = self.head;
        if !obj.is_null() {
            self.head = unsafe { (*obj).next };
            self.length -= 1;
        }
        obj
    }

    #[inline]
    fn push(&mut self, obj: *mut FreeObject) {
        unsafe { (*obj).next = self.head };
        self.head = obj;
        self.length += 1;
    }

    /// Push a linked list of `count` objects onto the front of this list.
    fn push_batch(&mut self, head: *mut FreeObject, count: u32) {
        if head.is_null() || count == 0 {
            return;
        }
        let mut tail = head;
        for _ in 1..count {
            let next = unsafe { (*tail).next };
            if next.is_null() {
                break;
            }
            tail = next;
        }
        unsafe { (*tail).next = self.head };
        self.head = head;
        self.length += count;
    }

    /// Pop up to `count` objects into a linked list. Returns `(actual_count, head, tail)`.
    fn pop_batch(&mut self, count: u32) -> (u32, *mut FreeObject, *mut FreeObject) {
        let mut head: *mut FreeObject = ptr::null_mut();
        let mut tail: *mut FreeObject = ptr::null_mut();
        let mut popped = 0u32;
        while popped < count && !self.head.is_null() {
            let obj = self.head;
            self.head = unsafe { (*obj).next };
            unsafe { (*obj).next = head };
            if tail.is_null() {
                tail = obj;
            }
            head = obj;
            popped += 1;
        }
        (popped, head, tail)
    }
}

/// Per-thread cache holding free lists for each size class.
pub struct ThreadCache {
    lists: [FreeList; NUM_SIZE_CLASSES],
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            lists: [const { FreeList::new() }; NUM_SIZE_CLASSES],
        }
    }

    /// Flush every cached object back to the central cache. Called on thread
    /// exit so outstanding objects don't leak span `use_count`.
    ///
    /// # Safety
    ///
    /// Must only be called once per thread cache lifetime.
    pub unsafe fn flush_and_destroy(
        &mut self,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        for class in 0..NUM_SIZE_CLASSES {
            let list = &mut self.lists[class];
            if list.length == 0 {
                continue;
            }
            let (count, head, tail) = list.pop_batch(list.length);
            if count > 0 {
                unsafe {
                    central_cache::insert_range_dropping_lock(
                        central.get(class),
                        head,
                        count as usize,
                        page_heap,
                        pagemap,
                    )
                };
                let _ = tail;
            }
        }
    }

    /// Allocate an object of the given size class.
    ///
    /// # Safety
    ///
    /// `class` must be a valid index in `0..NUM_SIZE_CLASSES`.
    #[inline]
    pub unsafe fn allocate(
        &mut self,
        class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) -> *mut u8 {
        let list = &mut self.lists[class];
        let obj = list.pop();
        if !obj.is_null() {
            return obj as *mut u8;
        }
        unsafe { self.fetch_batch(class, central, page_heap, pagemap) }
    }

    /// Deallocate an object of the given size class.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a prior `allocate` call for `class`.
    #[inline]
    pub unsafe fn deallocate(
        &mut self,
        ptr: *mut u8,
        class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        let list = &mut self.lists[class];
        let obj = ptr as *mut FreeObject;
        list.push(obj);

        if list.length >= list.max_length {
            unsafe { self.release_batch(class, central, page_heap, pagemap) };
        }
    }

    /// Slow path: draw a batch from the central cache, keep all but one
    /// object, and return the last to the caller. `desired` is
    /// `min(objects_per_batch(obj_size), max_length)`; reaching the cap
    /// grows it by one (slow-start).
    #[cold]
    unsafe fn fetch_batch(
        &mut self,
        class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) -> *mut u8 {
        let info = size_class::class_info(class);
        let list = &mut self.lists[class];
        let desired = (list.max_length as usize).min(info.batch_size).max(1);

        let (count, head) = unsafe {
            central_cache::remove_range_dropping_lock(
                central.get(class),
                class,
                desired,
                page_heap,
                pagemap,
            )
        };

        if count == 0 || head.is_null() {
            return ptr::null_mut();
        }

        if desired == list.max_length as usize {
            list.max_length += 1;
        }

        let result = head;
        let remaining_head = unsafe { (*head).next };
        let remaining_count = count - 1;
        if remaining_count > 0 {
            list.push_batch(remaining_head, remaining_count as u32);
        }

        result as *mut u8
    }

    /// Detach the first `max_length` objects and hand them to the central cache.
    unsafe fn release_batch(
        &mut self,
        class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        let list = &mut self.lists[class];
        let to_release = list.max_length.min(list.length);
        if to_release == 0 {
            return;
        }
        let (count, head, _tail) = list.pop_batch(to_release);
        unsafe {
            central_cache::insert_range_dropping_lock(
                central.get(class),
                head,
                count as usize,
                page_heap,
                pagemap,
            )
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_heap::PageHeap;
    use crate::pagemap::PageMap;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    fn make_test_env() -> (&'static PageMap, SpinMutex<PageHeap>, CentralCache) {
        let pm = Box::leak(Box::new(PageMap::new()));
        let heap = SpinMutex::new(PageHeap::new(pm));
        let cache = CentralCache::new();
        (pm, heap, cache)
    }

    #[test]
    fn test_allocate_and_deallocate() {
        let (pm, heap, central) = make_test_env();
        let mut tc = ThreadCache::new();

        unsafe {
            let ptr = tc.allocate(0, &central, &heap, pm);
            assert!(!ptr.is_null());
            tc.deallocate(ptr, 0, &central, &heap, pm);
        }
    }

    #[test]
    fn test_allocate_many() {
        let (pm, heap, central) = make_test_env();
        let mut tc = ThreadCache::new();

        unsafe {
            let mut ptrs = Vec::new();
            for _ in 0..1000 {
                let ptr = tc.allocate(3, &central, &heap, pm);
                assert!(!ptr.is_null());
                ptrs.push(ptr);
            }
            for ptr in ptrs {
                tc.deallocate(ptr, 3, &central, &heap, pm);
            }
        }
    }

    #[test]
    fn test_mixed_sizes() {
        let (pm, heap, central) = make_test_env();
        let mut tc = ThreadCache::new();

        unsafe {
            let mut allocs: Vec<(usize, *mut u8)> = Vec::new();
            for class in [0, 3, 7, 11, 15, 19, 23] {
                for _ in 0..50 {
                    let ptr = tc.allocate(class, &central, &heap, pm);
                    assert!(!ptr.is_null());
                    allocs.push((class, ptr));
                }
            }
            for (class, ptr) in allocs {
                tc.deallocate(ptr, class, &central, &heap, pm);
            }
        }
    }

    #[test]
    fn test_reuse_from_cache() {
        let (pm, heap, central) = make_test_env();
        let mut tc = ThreadCache::new();

        unsafe {
            let ptr1 = tc.allocate(1, &central, &heap, pm);
            assert!(!ptr1.is_null());
            tc.deallocate(ptr1, 1, &central, &heap, pm);

            let ptr2 = tc.allocate(1, &central, &heap, pm);
            assert!(!ptr2.is_null());
            assert_eq!(ptr1, ptr2);

            tc.deallocate(ptr2, 1, &central, &heap, pm);
        }
    }

    #[test]
    fn test_slow_start_grows_max_length() {
        let (pm, heap, central) = make_test_env();
        let mut tc = ThreadCache::new();

        // class 0 = 8 bytes, objects_per_batch = 512. Drive enough
        // allocate/deallocate-one cycles that max_length should grow past 1.
        unsafe {
            for _ in 0..5 {
                let ptr = tc.allocate(0, &central, &heap, pm);
                assert!(!ptr.is_null());
                tc.deallocate(ptr, 0, &central, &heap, pm);
            }
            assert!(tc.lists[0].max_length >= 1);
        }
    }

    #[test]
    fn test_warmup_slow_start_bucket_lock_count() {
        // 520 allocations of size 16, no frees: max_length starts at 1 and
        // grows by one each time a full batch is drawn, so fetch_batch runs
        // with batch sizes 1, 2, 3, ... A fetch_batch call is exactly the
        // bucket-lock acquisition this counts. 1+2+...+31 = 496, leaving 24
        // more objects to satisfy — drawn in the 32nd fetch_batch's batch of
        // 32, with no further refill needed. 32 acquisitions total.
        let (pm, heap, central) = make_test_env();
        let mut tc = ThreadCache::new();
        let class = size_class::index(16).unwrap();
        assert_eq!(size_class::objects_per_batch(16), 512);

        let mut fetch_count = 0u32;
        unsafe {
            for _ in 0..520 {
                if tc.lists[class].length == 0 {
                    fetch_count += 1;
                }
                let ptr = tc.allocate(class, &central, &heap, pm);
                assert!(!ptr.is_null());
            }
        }

        assert_eq!(fetch_count, 32);
        assert_eq!(tc.lists[class].max_length, 33);
    }
}
