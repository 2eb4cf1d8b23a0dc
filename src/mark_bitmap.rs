use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::MmapMut;

use crate::address::Address;
use crate::globals::MIN_OBJ_ALIGNMENT;

const BITS_PER_WORD: usize = size_of::<usize>() * 8;

/// One bit per possible object start (every two heap words) over the reserved heap.
///
/// The concurrent marker and full collections record live objects here. Bits are
/// only ever set with [`par_mark`](Self::par_mark), which is safe against other
/// markers and against evacuation workers marking copies.
pub struct MarkBitmap {
    mem_map: MmapMut,
    bitmap_begin: *const AtomicUsize,
    bitmap_words: usize,
    heap_begin: Address,
    heap_limit: Address,
}

unsafe impl Send for MarkBitmap {}
unsafe impl Sync for MarkBitmap {}

impl MarkBitmap {
    pub fn new(heap_begin: Address, heap_size: usize) -> std::io::Result<Self> {
        let bytes = Self::compute_bitmap_size(heap_size);
        let mut mem_map = MmapMut::map_anon(bytes.max(size_of::<usize>()))?;
        let bitmap_begin = mem_map.as_mut_ptr() as *const AtomicUsize;
        Ok(Self {
            mem_map,
            bitmap_begin,
            bitmap_words: bytes / size_of::<usize>(),
            heap_begin,
            heap_limit: heap_begin + heap_size,
        })
    }

    pub fn compute_bitmap_size(capacity: usize) -> usize {
        let bytes_covered_per_word = MIN_OBJ_ALIGNMENT * BITS_PER_WORD;
        crate::globals::align_up(capacity, bytes_covered_per_word) / bytes_covered_per_word
            * size_of::<usize>()
    }

    pub fn mem_map_size(&self) -> usize {
        self.mem_map.len()
    }

    #[inline]
    fn offset_to_index(offset: usize) -> usize {
        offset / MIN_OBJ_ALIGNMENT / BITS_PER_WORD
    }

    #[inline]
    fn offset_to_mask(offset: usize) -> usize {
        1 << ((offset / MIN_OBJ_ALIGNMENT) % BITS_PER_WORD)
    }

    #[inline]
    fn word(&self, index: usize) -> &AtomicUsize {
        debug_assert!(index < self.bitmap_words, "bitmap word {} out of range", index);
        unsafe { &*self.bitmap_begin.add(index) }
    }

    #[inline]
    pub fn has_address(&self, addr: Address) -> bool {
        self.heap_begin <= addr && addr < self.heap_limit
    }

    #[inline]
    pub fn is_marked(&self, addr: Address) -> bool {
        debug_assert!(self.has_address(addr), "{:?} not covered by the mark bitmap", addr);
        let offset = addr - self.heap_begin;
        self.word(Self::offset_to_index(offset)).load(Ordering::Acquire) & Self::offset_to_mask(offset) != 0
    }

    /// Sets the bit for `addr`. Returns true if this call set it.
    #[inline]
    pub fn par_mark(&self, addr: Address) -> bool {
        debug_assert!(self.has_address(addr), "{:?} not covered by the mark bitmap", addr);
        let offset = addr - self.heap_begin;
        let mask = Self::offset_to_mask(offset);
        let entry = self.word(Self::offset_to_index(offset));
        let mut old_word = entry.load(Ordering::Relaxed);
        loop {
            if old_word & mask != 0 {
                return false;
            }
            match entry.compare_exchange_weak(old_word, old_word | mask, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(current) => old_word = current,
            }
        }
    }

    #[inline]
    pub fn clear(&self, addr: Address) {
        let offset = addr - self.heap_begin;
        self.word(Self::offset_to_index(offset))
            .fetch_and(!Self::offset_to_mask(offset), Ordering::AcqRel);
    }

    /// Clears every bit covering `[begin, end)`.
    pub fn clear_range(&self, begin: Address, end: Address) {
        if end <= begin {
            return;
        }
        let mut begin_offset = begin - self.heap_begin;
        let mut end_offset = end - self.heap_begin;
        while begin_offset < end_offset && (begin_offset / MIN_OBJ_ALIGNMENT) % BITS_PER_WORD != 0 {
            self.clear(self.heap_begin + begin_offset);
            begin_offset += MIN_OBJ_ALIGNMENT;
        }
        while begin_offset < end_offset && (end_offset / MIN_OBJ_ALIGNMENT) % BITS_PER_WORD != 0 {
            end_offset -= MIN_OBJ_ALIGNMENT;
            self.clear(self.heap_begin + end_offset);
        }
        let first = Self::offset_to_index(begin_offset);
        let last = Self::offset_to_index(end_offset);
        for index in first..last {
            self.word(index).store(0, Ordering::Relaxed);
        }
    }

    pub fn clear_all(&self) {
        unsafe {
            std::ptr::write_bytes(self.bitmap_begin as *mut usize, 0, self.bitmap_words);
        }
    }

    /// Visits the marked addresses in `[begin, end)` in ascending order.
    pub fn visit_marked_range(&self, begin: Address, end: Address, mut visitor: impl FnMut(Address)) {
        if end <= begin {
            return;
        }
        let begin_offset = begin - self.heap_begin;
        let end_offset = end - self.heap_begin;
        let covered = MIN_OBJ_ALIGNMENT * BITS_PER_WORD;
        let first = Self::offset_to_index(begin_offset);
        let last = Self::offset_to_index(end_offset - 1);
        for index in first..=last {
            let mut word = self.word(index).load(Ordering::Acquire);
            while word != 0 {
                let shift = word.trailing_zeros() as usize;
                word &= word - 1;
                let offset = index * covered + shift * MIN_OBJ_ALIGNMENT;
                if offset >= begin_offset && offset < end_offset {
                    visitor(self.heap_begin + offset);
                }
            }
        }
    }
}
