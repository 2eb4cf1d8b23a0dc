use crate::address::Address;
use crate::header::fill_range;

/// Bump-pointer buffer carved out of an allocation region.
///
/// Mutators hold one as their TLAB; GC workers hold one per allocation purpose as
/// their promotion buffer. A buffer is owned by exactly one thread and is never
/// shared, so allocation inside it needs no atomics.
pub struct LocalAllocBuffer {
    start: Address,
    top: Address,
    end: Address,
    words_allocated: usize,
    words_wasted: usize,
    refills: usize,
}

impl LocalAllocBuffer {
    pub const fn new() -> Self {
        Self {
            start: Address::ZERO,
            top: Address::ZERO,
            end: Address::ZERO,
            words_allocated: 0,
            words_wasted: 0,
            refills: 0,
        }
    }

    #[inline(always)]
    pub fn allocate(&mut self, words: usize) -> Option<Address> {
        if self.end.words_from(self.top) >= words && !self.top.is_zero() {
            let result = self.top;
            self.top = result.add_words(words);
            Some(result)
        } else {
            None
        }
    }

    /// Gives back the last allocation of `words` at `addr` if nothing came after it.
    pub fn undo_allocation(&mut self, addr: Address, words: usize) -> bool {
        if !addr.is_zero() && addr.add_words(words) == self.top {
            self.top = addr;
            true
        } else {
            false
        }
    }

    /// Installs a fresh buffer `[start, start + words)`. The previous buffer must
    /// already be retired.
    pub fn set_buf(&mut self, start: Address, words: usize) {
        debug_assert!(self.is_empty_buffer());
        self.start = start;
        self.top = start;
        self.end = start.add_words(words);
        self.refills += 1;
    }

    /// Fills the unused tail so the region stays parsable and forgets the buffer.
    /// Returns the range the buffer covered.
    pub fn retire(&mut self) -> Option<(Address, Address)> {
        if self.is_empty_buffer() {
            return None;
        }
        let remaining = self.end.words_from(self.top);
        fill_range(self.top, self.end);
        self.words_wasted += remaining;
        self.words_allocated += self.top.words_from(self.start);
        let range = (self.start, self.end);
        self.start = Address::ZERO;
        self.top = Address::ZERO;
        self.end = Address::ZERO;
        Some(range)
    }

    /// Forgets the buffer without touching memory. Used when the region it lives in
    /// is about to be discarded wholesale.
    pub fn discard(&mut self) {
        self.start = Address::ZERO;
        self.top = Address::ZERO;
        self.end = Address::ZERO;
    }

    #[inline]
    pub fn is_empty_buffer(&self) -> bool {
        self.start.is_zero()
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn top(&self) -> Address {
        self.top
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub fn free_words(&self) -> usize {
        self.end.words_from(self.top)
    }

    pub fn words_allocated(&self) -> usize {
        self.words_allocated
    }

    pub fn words_wasted(&self) -> usize {
        self.words_wasted
    }

    pub fn refills(&self) -> usize {
        self.refills
    }
}

impl Default for LocalAllocBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether an object that did not fit into a buffer of `buffer_words` should
/// trigger a buffer refill rather than a direct allocation.
#[inline]
pub fn should_refill(words: usize, buffer_words: usize, waste_percent: usize) -> bool {
    words * 100 < buffer_words * waste_percent
}
