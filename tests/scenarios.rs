//! Black-box integration tests for the named stress scenarios: large
//! allocations that bypass size classes entirely, and freeing an object on a
//! different thread than the one that allocated it.

use std::alloc::{GlobalAlloc, Layout};
use tcrsmalloc::ThreadCacheAlloc;

#[global_allocator]
static GLOBAL: ThreadCacheAlloc = ThreadCacheAlloc;

struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}

#[test]
fn large_passthrough_above_max_pages() {
    // 2 MiB is well above MAX_PAGES * PAGE_SIZE (128 * 8192 = 1 MiB), so this
    // is served directly by the page heap's OS path, not a cached span.
    let layout = Layout::from_size_align(2 * 1024 * 1024, 8).unwrap();

    #[cfg(feature = "stats")]
    let os_allocs_before = tcrsmalloc::stats::snapshot().os_alloc_count;

    let first_addr;
    unsafe {
        let ptr = GLOBAL.alloc(layout);
        assert!(!ptr.is_null());
        ptr.write_bytes(0x5A, layout.size());
        for i in 0..layout.size() {
            assert_eq!(*ptr.add(i), 0x5A);
        }
        first_addr = ptr as usize;
        GLOBAL.dealloc(ptr, layout);
    }

    // The pages were returned to the OS rather than cached as a span: a
    // second identical request must go through `page_alloc` again, not reuse
    // the freed span's address out of a `large_spans`-style cache.
    unsafe {
        let ptr = GLOBAL.alloc(layout);
        assert!(!ptr.is_null());
        assert_ne!(
            ptr as usize, first_addr,
            "second passthrough allocation reused the first's address; \
             the span was cached instead of released to the OS"
        );
        GLOBAL.dealloc(ptr, layout);
    }

    #[cfg(feature = "stats")]
    {
        let os_allocs_after = tcrsmalloc::stats::snapshot().os_alloc_count;
        assert!(
            os_allocs_after >= os_allocs_before + 2,
            "expected both passthrough allocations to hit platform::page_alloc \
             directly, got {os_allocs_before} -> {os_allocs_after}"
        );
    }
}

#[test]
fn cross_thread_free() {
    // Thread A allocates, thread B frees. The object must route back to the
    // central cache (and ultimately the originating span) without a thread
    // cache of its own for that class getting confused about ownership.
    let layout = Layout::from_size_align(32, 8).unwrap();

    for _ in 0..64 {
        let ptr = unsafe { GLOBAL.alloc(layout) };
        assert!(!ptr.is_null());
        unsafe { ptr.write_bytes(0x7E, 32) };

        let send = SendPtr(ptr);
        let handle = std::thread::spawn(move || {
            let ptr = send.0;
            for i in 0..32 {
                assert_eq!(unsafe { *ptr.add(i) }, 0x7E);
            }
            unsafe { GLOBAL.dealloc(ptr, Layout::from_size_align(32, 8).unwrap()) };
        });
        handle.join().unwrap();
    }
}

#[test]
fn cross_thread_free_many_outstanding() {
    // Allocate a batch on the main thread, hand all of them to a second
    // thread to free at once, exercising a full release_batch flush.
    let layout = Layout::from_size_align(16, 8).unwrap();
    let ptrs: Vec<SendPtr> = (0..600)
        .map(|_| {
            let ptr = unsafe { GLOBAL.alloc(layout) };
            assert!(!ptr.is_null());
            SendPtr(ptr)
        })
        .collect();

    let handle = std::thread::spawn(move || {
        for p in ptrs {
            unsafe { GLOBAL.dealloc(p.0, Layout::from_size_align(16, 8).unwrap()) };
        }
    });
    handle.join().unwrap();
}
