//! Compile-time constants. These form an ABI contract for the size-class
//! mapping (see `size_class.rs`) and are not meant to be tuned at build time
//! or runtime — changing any of them changes which size class a given byte
//! count maps to.

/// log2 of the page size. Pages are 8 KiB.
pub const PAGE_SHIFT: usize = 13;
/// Page size in bytes, derived from `PAGE_SHIFT`.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Largest request size served by the thread-cache/central-cache hierarchy.
/// Requests above this go straight to the page heap.
pub const MAX_BYTES: usize = 256 * 1024;

/// Maximum span length (in pages) tracked by the page heap's length lists.
/// Spans larger than this are allocated/freed directly against the OS
/// interface with no coalescing.
pub const MAX_PAGES: usize = 128;

/// Number of effective size classes (see `size_class.rs`). The allocator
/// reserves `NUM_SIZE_CLASS_SLOTS` array slots so a future class table can
/// grow without an ABI break in the slot count itself, even though only the
/// first `NUM_SIZE_CLASSES` are populated.
pub const NUM_SIZE_CLASSES: usize = 208;
/// Reserved slot count backing `size_class::SIZE_CLASSES` and every
/// per-class array in the central cache.
pub const NUM_SIZE_CLASS_SLOTS: usize = 256;

/// Usable virtual address width backing the page map's radix tree. Real
/// 64-bit hardware only decodes 48 bits of a canonical virtual address
/// (x86_64, most aarch64 configurations) — using the full 64-bit pointer
/// width here would just make the radix tree's root level enormous for no
/// benefit, so the reverse map is sized to the address space the hardware
/// actually uses.
pub const ADDRESS_BITS: usize = 48;

/// Minimum and maximum batch size a thread cache may request from the
/// central cache in one refill.
pub const MIN_OBJECTS_PER_BATCH: usize = 2;
pub const MAX_OBJECTS_PER_BATCH: usize = 512;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_matches_shift() {
        assert_eq!(PAGE_SIZE, 8192);
    }

    #[test]
    fn max_bytes_is_256_kib() {
        assert_eq!(MAX_BYTES, 262_144);
    }

    #[test]
    fn slot_reservation_covers_effective_classes() {
        assert!(NUM_SIZE_CLASS_SLOTS >= NUM_SIZE_CLASSES);
    }
}
