//! Three-level radix tree mapping page numbers to owning `Span` pointers —
//! the reverse map that lets `object_to_span` recover a span from any
//! pointer an application holds.
//!
//! `config::ADDRESS_BITS - PAGE_SHIFT` (48 - 13 = 35) bits of page number
//! are split into three roughly-equal fields: root 12 bits, mid 12 bits,
//! leaf 11 bits. The root is statically embedded in the `PageMap` (16 KiB);
//! mid and leaf nodes are lazily allocated from the metadata pool. Reads are
//! lock-free (`AtomicPtr` with acquire loads); writes require external
//! synchronization (the page-heap lock) and publish with release stores.

use crate::metadata_pool::Slab;
use crate::span::Span;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

const ROOT_BITS: usize = 12;
const MID_BITS: usize = 12;
const LEAF_BITS: usize = 11;

const ROOT_LEN: usize = 1 << ROOT_BITS; // 4096
const MID_LEN: usize = 1 << MID_BITS; // 4096
const LEAF_LEN: usize = 1 << LEAF_BITS; // 2048

const MID_SHIFT: usize = LEAF_BITS;
const ROOT_SHIFT: usize = LEAF_BITS + MID_BITS;

const MID_MASK: usize = (1 << MID_BITS) - 1;
const LEAF_MASK: usize = (1 << LEAF_BITS) - 1;

#[repr(C)]
struct MidNode {
    children: [AtomicPtr<LeafNode>; MID_LEN],
}

#[repr(C)]
struct LeafNode {
    spans: [AtomicPtr<Span>; LEAF_LEN],
}

static MID_POOL: Slab<MidNode> = Slab::new();
static LEAF_POOL: Slab<LeafNode> = Slab::new();

/// Three-level radix tree for page number -> `*mut Span` lookup.
pub struct PageMap {
    root: [AtomicPtr<MidNode>; ROOT_LEN],
}

// AtomicPtr is Send + Sync; every operation exposed here is either
// lock-free-safe (`get`) or documented as requiring external synchronization
// (`set` and friends).
unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

/// Build a const-initialized array of null `AtomicPtr`s. Const generics
/// don't let us write `[AtomicPtr::new(null_mut()); N]` directly for
/// non-`Copy` types, but the all-null bit pattern is the same as zeroed
/// memory, so a `usize` array transmutes cleanly.
macro_rules! null_atomic_array {
    ($len:expr, $T:ty) => {{
        unsafe { core::mem::transmute::<[usize; $len], [AtomicPtr<$T>; $len]>([0usize; $len]) }
    }};
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMap {
    /// Create a new, empty page map. All root entries are null.
    pub const fn new() -> Self {
        Self {
            root: null_atomic_array!(ROOT_LEN, MidNode),
        }
    }

    /// Look up the span owning `page_id`. Returns null if unset. Lock-free.
    #[inline]
    pub fn get(&self, page_id: usize) -> *mut Span {
        let root_idx = page_id >> ROOT_SHIFT;
        let mid_idx = (page_id >> MID_SHIFT) & MID_MASK;
        let leaf_idx = page_id & LEAF_MASK;

        if root_idx >= ROOT_LEN {
            return ptr::null_mut();
        }

        let mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            return ptr::null_mut();
        }

        let leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
        if leaf.is_null() {
            return ptr::null_mut();
        }

        unsafe { (*leaf).spans[leaf_idx].load(Ordering::Acquire) }
    }

    /// Set the span owning `page_id`, lazily allocating interior nodes.
    ///
    /// # Safety
    /// Must be called under external synchronization (the page-heap lock).
    pub unsafe fn set(&self, page_id: usize, span: *mut Span) {
        let root_idx = page_id >> ROOT_SHIFT;
        let mid_idx = (page_id >> MID_SHIFT) & MID_MASK;
        let leaf_idx = page_id & LEAF_MASK;

        assert!(root_idx < ROOT_LEN, "page id out of range for page map");

        let mut mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            mid = MID_POOL.alloc_zeroed();
            assert!(!mid.is_null(), "failed to allocate mid node");
            self.root[root_idx].store(mid, Ordering::Release);
        }

        let mut leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
        if leaf.is_null() {
            leaf = LEAF_POOL.alloc_zeroed();
            assert!(!leaf.is_null(), "failed to allocate leaf node");
            unsafe { (*mid).children[mid_idx].store(leaf, Ordering::Release) };
        }

        unsafe { (*leaf).spans[leaf_idx].store(span, Ordering::Release) };
    }

    /// Register a span for every page it covers (for spans that are, or are
    /// about to become, `in_use`: size-classed spans and large allocations).
    ///
    /// # Safety
    /// Must be called under external synchronization.
    pub unsafe fn register_span(&self, span: *mut Span) {
        let start = unsafe { (*span).start };
        let count = unsafe { (*span).page_count };
        for page_id in start..start + count {
            unsafe { self.set(page_id, span) };
        }
    }

    /// Register only the first and last page of an idle span.
    ///
    /// Idle spans only need endpoints in the reverse map, since coalescing
    /// only ever probes the pages immediately adjacent to a span's start and
    /// end (§4.4). This is O(1) instead of O(page_count). Spans that are, or
    /// are about to become, `in_use` must use [`register_span`] instead,
    /// since `object_to_span` must resolve from any interior page.
    ///
    /// # Safety
    /// Must be called under external synchronization.
    pub unsafe fn register_span_endpoints(&self, span: *mut Span) {
        let start = unsafe { (*span).start };
        let count = unsafe { (*span).page_count };
        unsafe { self.set(start, span) };
        if count > 1 {
            unsafe { self.set(start + count - 1, span) };
        }
    }

    /// Clear every page entry this span currently occupies.
    ///
    /// # Safety
    /// Must be called under external synchronization.
    pub unsafe fn unregister_span(&self, span: *mut Span) {
        let start = unsafe { (*span).start };
        let count = unsafe { (*span).page_count };
        for page_id in start..start + count {
            unsafe { self.set(page_id, ptr::null_mut()) };
        }
    }
}
