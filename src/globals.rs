//! Sizes and constants shared by every part of the collector.

/// Size of a heap word in bytes. All object sizes are expressed in words.
pub const HEAP_WORD_SIZE: usize = 8;
pub const LOG_HEAP_WORD_SIZE: usize = 3;
/// Objects are aligned to two heap words so that the smallest object (a bare header)
/// always fits a filler.
pub const MIN_OBJ_ALIGNMENT_WORDS: usize = 2;
pub const MIN_OBJ_ALIGNMENT: usize = MIN_OBJ_ALIGNMENT_WORDS * HEAP_WORD_SIZE;
/// Header words: mark word followed by the layout word.
pub const HEADER_WORDS: usize = 2;

pub const MIN_REGION_SIZE: usize = 256 * 1024;
pub const MAX_REGION_SIZE: usize = 32 * 1024 * 1024;
/// Number of regions the default region size aims for.
pub const TARGET_REGION_NUMBER: usize = 2048;
/// Forwarding marks hold a 32-bit word index from the heap base, which caps
/// the reserved heap at 2^32 words.
pub const MAX_HEAP_SIZE: u64 = (1u64 << 32) * HEAP_WORD_SIZE as u64;

/// log2 of the card size. Cards are 512 bytes.
pub const CARD_SHIFT: usize = 9;
pub const CARD_SIZE: usize = 1 << CARD_SHIFT;
pub const CARD_SIZE_IN_WORDS: usize = CARD_SIZE / HEAP_WORD_SIZE;

/// Capacity of a worker's work-stealing queue before entries spill into its overflow list.
pub const TASKQUEUE_SIZE: usize = 1 << 14;

/// Largest age an object header can record.
pub const MAX_AGE: u8 = 15;
pub const AGE_TABLE_SIZE: usize = MAX_AGE as usize + 1;

/// Emit a warning after this many unsuccessful allocate/collect rounds.
pub const QUEUED_ALLOCATION_WARNING_COUNT: usize = 1000;

#[inline]
pub fn which_power_of_two(value: usize) -> usize {
    value.trailing_zeros() as _
}

#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[inline]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Rounds `value` down to a power of two.
pub fn round_down_power_of_2(value: usize) -> usize {
    if value == 0 {
        return 0;
    }
    1 << (usize::BITS - 1 - value.leading_zeros())
}

#[inline]
pub const fn bytes_to_words(bytes: usize) -> usize {
    bytes >> LOG_HEAP_WORD_SIZE
}

#[inline]
pub const fn words_to_bytes(words: usize) -> usize {
    words << LOG_HEAP_WORD_SIZE
}

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}
