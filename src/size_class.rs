//! Size classification: mapping request byte counts to fixed-size object
//! classes, and the per-class batch/span sizing policy.
//!
//! The class table is piecewise: five bands, each with its own alignment,
//! chosen so that internal fragmentation per object stays under ~10%. Unlike
//! a hand-tuned table, the bands are derived by a `const fn` at compile time
//! from the band boundaries below, since the mapping is a bit-exact ABI
//! contract (see `config.rs`) rather than a tunable.

use crate::config::{
    MAX_BYTES, MAX_OBJECTS_PER_BATCH, MIN_OBJECTS_PER_BATCH, NUM_SIZE_CLASSES,
    NUM_SIZE_CLASS_SLOTS, PAGE_SHIFT,
};

/// One band of the size-class table: byte range `(prev_max, max]` and alignment.
struct Band {
    max: usize,
    align: usize,
}

const BANDS: [Band; 5] = [
    Band { max: 128, align: 8 },
    Band {
        max: 1_024,
        align: 16,
    },
    Band {
        max: 8_192,
        align: 128,
    },
    Band {
        max: 65_536,
        align: 1_024,
    },
    Band {
        max: 262_144,
        align: 8_192,
    },
];

/// Per-class metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClassInfo {
    /// The fixed object size served by this class (the band-rounded upper
    /// bound of its slot within the band).
    pub size: usize,
    /// Number of pages a freshly carved span of this class should span.
    pub pages: usize,
    /// Number of objects moved between central cache and thread cache per
    /// batch transfer.
    pub batch_size: usize,
}

const fn class_count_before(band_idx: usize) -> usize {
    let mut count = 0;
    let mut i = 0;
    let mut prev_max = 0usize;
    while i < band_idx {
        let band = &BANDS[i];
        count += (band.max - prev_max) / band.align;
        prev_max = band.max;
        i += 1;
    }
    count
}

const fn clamp(v: usize, lo: usize, hi: usize) -> usize {
    if v < lo {
        lo
    } else if v > hi {
        hi
    } else {
        v
    }
}

const fn objects_per_batch_const(obj_size: usize) -> usize {
    clamp(MAX_BYTES / obj_size, MIN_OBJECTS_PER_BATCH, MAX_OBJECTS_PER_BATCH)
}

const fn pages_per_span_const(obj_size: usize) -> usize {
    let batch = objects_per_batch_const(obj_size);
    let bytes = batch * obj_size;
    let pages = bytes >> PAGE_SHIFT;
    if pages == 0 { 1 } else { pages }
}

const fn build_table() -> [SizeClassInfo; NUM_SIZE_CLASS_SLOTS] {
    let mut table = [SizeClassInfo {
        size: 0,
        pages: 0,
        batch_size: 0,
    }; NUM_SIZE_CLASS_SLOTS];

    let mut band_idx = 0;
    let mut prev_max = 0usize;
    let mut class = 0usize;
    while band_idx < BANDS.len() {
        let band = &BANDS[band_idx];
        let mut slot_base = prev_max;
        while slot_base < band.max {
            let size = slot_base + band.align;
            table[class] = SizeClassInfo {
                size,
                pages: pages_per_span_const(size),
                batch_size: objects_per_batch_const(size),
            };
            class += 1;
            slot_base += band.align;
        }
        prev_max = band.max;
        band_idx += 1;
    }
    table
}

/// The size-class table, indexed `0..NUM_SIZE_CLASSES`. Slots beyond
/// `NUM_SIZE_CLASSES` (up to `NUM_SIZE_CLASS_SLOTS`) are zeroed and unused,
/// reserved so callers can size per-class arrays generously without an ABI
/// break if the effective class count ever grows.
pub static SIZE_CLASSES: [SizeClassInfo; NUM_SIZE_CLASS_SLOTS] = build_table();

/// Round `n` up to the alignment of the band it falls into. `n` must be
/// `1..=MAX_BYTES`.
#[inline]
pub const fn round_up(n: usize) -> usize {
    let mut band_idx = 0;
    while band_idx < BANDS.len() {
        let band = &BANDS[band_idx];
        if n <= band.max {
            let align = band.align;
            return (n + align - 1) & !(align - 1);
        }
        band_idx += 1;
    }
    n
}

/// Map a byte count (`1..=MAX_BYTES`) to its size class index (`0..NUM_SIZE_CLASSES`).
///
/// Returns `None` if `n` is 0 or exceeds `MAX_BYTES` — such requests bypass
/// size classes entirely and are served directly by the page heap.
#[inline]
pub const fn index(n: usize) -> Option<usize> {
    if n == 0 || n > MAX_BYTES {
        return None;
    }
    let mut band_idx = 0;
    while band_idx < BANDS.len() {
        let band = &BANDS[band_idx];
        if n <= band.max {
            let align = band.align;
            // index-within-band per spec: ((n + align - 1) >> log2(align)) - 1
            let rounded_count = (n + align - 1) / align;
            let within_band = rounded_count - 1;
            return Some(class_count_before(band_idx) + within_band);
        }
        band_idx += 1;
    }
    None
}

/// The fixed object size served by `class`.
#[inline]
pub fn class_to_size(class: usize) -> usize {
    SIZE_CLASSES[class].size
}

/// Number of objects moved between central cache and thread cache per batch
/// transfer, for a class whose object size is `obj_size`.
#[inline]
pub const fn objects_per_batch(obj_size: usize) -> usize {
    objects_per_batch_const(obj_size)
}

/// Number of pages a freshly carved span for `obj_size` should occupy.
#[inline]
pub const fn pages_per_span(obj_size: usize) -> usize {
    pages_per_span_const(obj_size)
}

/// Full per-class info lookup.
#[inline]
pub fn class_info(class: usize) -> SizeClassInfo {
    SIZE_CLASSES[class]
}
