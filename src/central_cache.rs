//! Central Cache (middle-end): per-size-class shared object pools.
//!
//! Each size class has its own `CentralFreeList` behind its own bucket lock,
//! so threads touching different classes never contend. Thread caches
//! fetch/return whole batches here; when a class's free list runs dry it
//! requests a new span from the page heap and carves it into objects.
//!
//! `remove_range_dropping_lock`/`insert_range_dropping_lock` are the only
//! entry points: both release the bucket lock before touching the page heap,
//! which the bucket-lock/page-heap-lock ordering discipline requires. There
//! is no lock-holding `remove_range`/`insert_range` alternative — adding one
//! back would make it too easy to call the page heap while still holding the
//! bucket lock.

use crate::config::{PAGE_SHIFT, PAGE_SIZE};
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::span::{FreeObject, Span, SpanList};
use crate::sync::SpinMutex;
use core::ptr;

/// Central free list for a single size class.
pub struct CentralFreeList {
    size_class: usize,
    /// Spans with at least one free object.
    nonempty_spans: SpanList,
    /// Total number of free objects across all spans in this class.
    num_free: usize,
}

// SAFETY: Only accessed through the enclosing SpinMutex.
unsafe impl Send for CentralFreeList {}

impl CentralFreeList {
    pub const fn new(size_class: usize) -> Self {
        Self {
            size_class,
            nonempty_spans: SpanList::new(),
            num_free: 0,
        }
    }

    /// Carve a pre-allocated span into objects and add it to the nonempty list.
    unsafe fn inject_span(&mut self, span: *mut Span, pagemap: &PageMap) {
        let info = size_class::class_info(self.size_class);
        let obj_size = info.size;

        unsafe {
            (*span).object_size = obj_size;
            (*span).in_use = true;

            pagemap.register_span(span);

            let base = (*span).start_addr();
            let span_bytes = (*span).page_count * PAGE_SIZE;
            let num_objects = span_bytes / obj_size;

            (*span).use_count = 0;

            let mut free_list: *mut FreeObject = ptr::null_mut();
            for i in (0..num_objects).rev() {
                let obj = base.add(i * obj_size) as *mut FreeObject;
                (*obj).next = free_list;
                free_list = obj;
            }

            (*span).free_list = free_list;
            self.num_free += num_objects;
            self.nonempty_spans.push(span);
        }
    }
}

/// Number of objects a span was originally carved into, derived from its
/// fixed object size rather than a separately tracked counter.
#[inline]
unsafe fn span_capacity(span: *mut Span) -> usize {
    unsafe { (*span).byte_size() / (*span).object_size }
}

/// Remove up to `batch_size` objects, dropping the bucket lock while the
/// page heap is consulted.
///
/// This keeps one thread's OS-memory wait (`page_alloc`) from blocking
/// every other thread wanting the same size class.
///
/// # Safety
///
/// `page_heap` and `pagemap` must be the global instances.
pub unsafe fn remove_range_dropping_lock(
    cfl_lock: &SpinMutex<CentralFreeList>,
    size_class: usize,
    batch_size: usize,
    page_heap: &SpinMutex<PageHeap>,
    pagemap: &PageMap,
) -> (usize, *mut FreeObject) {
    let info = size_class::class_info(size_class);
    let mut head: *mut FreeObject = ptr::null_mut();
    let mut count = 0;

    loop {
        {
            let mut cfl = cfl_lock.lock();

            while count < batch_size && !cfl.nonempty_spans.is_empty() {
                let span = cfl.nonempty_spans.head;
                unsafe {
                    while count < batch_size && !(*span).free_list.is_null() {
                        let obj = (*span).free_list;
                        (*span).free_list = (*obj).next;
                        (*obj).next = head;
                        head = obj;
                        (*span).use_count += 1;
                        count += 1;
                        cfl.num_free -= 1;
                    }
                    if (*span).free_list.is_null() {
                        cfl.nonempty_spans.remove(span);
                    }
                }
            }

            if count >= batch_size {
                return (count, head);
            }
            // Bucket lock dropped here, before touching the page heap.
        }

        let span = unsafe { page_heap.lock().allocate_span(info.pages) };
        if span.is_null() {
            return (count, head); // OOM, return what we have
        }

        {
            let mut cfl = cfl_lock.lock();
            unsafe { cfl.inject_span(span, pagemap) };
        }
    }
}

/// Insert objects back, dropping the bucket lock while returning emptied
/// spans to the page heap.
///
/// # Safety
///
/// `head` must point to a valid linked list of `count` `FreeObject`s.
pub unsafe fn insert_range_dropping_lock(
    cfl_lock: &SpinMutex<CentralFreeList>,
    mut head: *mut FreeObject,
    count: usize,
    page_heap: &SpinMutex<PageHeap>,
    pagemap: &PageMap,
) {
    const MAX_FREED: usize = 8;
    let mut freed_spans: [*mut Span; MAX_FREED] = [ptr::null_mut(); MAX_FREED];
    let mut num_freed = 0;

    {
        let mut cfl = cfl_lock.lock();
        let mut remaining = count;

        while !head.is_null() && remaining > 0 {
            let obj = head;
            unsafe { head = (*obj).next };
            remaining -= 1;

            let page_id = (obj as usize) >> PAGE_SHIFT;
            let span = pagemap.get(page_id);
            if span.is_null() {
                continue;
            }

            unsafe {
                let was_full = (*span).free_list.is_null();

                (*obj).next = (*span).free_list;
                (*span).free_list = obj;
                (*span).use_count -= 1;
                cfl.num_free += 1;

                if was_full {
                    cfl.nonempty_spans.push(span);
                }

                if (*span).use_count == 0 {
                    cfl.nonempty_spans.remove(span);
                    cfl.num_free -= span_capacity(span);
                    (*span).free_list = ptr::null_mut();

                    if num_freed < MAX_FREED {
                        freed_spans[num_freed] = span;
                        num_freed += 1;
                    } else {
                        page_heap.lock().deallocate_span(span);
                    }
                }
            }
        }
    }
    // Bucket lock dropped before touching the page heap.

    for span in freed_spans.iter().take(num_freed) {
        unsafe { page_heap.lock().deallocate_span(*span) };
    }
}

/// Array of central free lists, one per size class, each independently
/// locked for fine-grained concurrency.
pub struct CentralCache {
    lists: [SpinMutex<CentralFreeList>; NUM_SIZE_CLASSES],
}

impl Default for CentralCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CentralCache {
    pub const fn new() -> Self {
        let mut lists = [const { SpinMutex::new(CentralFreeList::new(0)) }; NUM_SIZE_CLASSES];
        let mut i = 0;
        while i < NUM_SIZE_CLASSES {
            lists[i] = SpinMutex::new(CentralFreeList::new(i));
            i += 1;
        }
        Self { lists }
    }

    /// The bucket lock for a size class.
    #[inline]
    pub fn get(&self, size_class: usize) -> &SpinMutex<CentralFreeList> {
        &self.lists[size_class]
    }
}
