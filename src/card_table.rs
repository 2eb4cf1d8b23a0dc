use std::sync::atomic::{AtomicU8, Ordering};

use memmap2::MmapMut;

use crate::address::Address;
use crate::globals::CARD_SHIFT;

#[inline(always)]
fn byte_cas(old_value: u8, new_value: u8, address: *mut u8) -> bool {
    unsafe {
        let address = &*address.cast::<AtomicU8>();
        address
            .compare_exchange(old_value, new_value, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

/// One byte per card of the reserved heap.
///
/// Mutators dirty cards from the post-write barrier; refinement cleans them again
/// once the cross-region pointers on them have been recorded in remembered sets.
/// Cards of young regions stay dirty so the barrier filters stores into them.
pub struct CardTable {
    /// Mmapped pages for the card table
    mem_map: MmapMut,
    begin: *mut u8,
    heap_begin: Address,
    num_cards: usize,
}

unsafe impl Send for CardTable {}
unsafe impl Sync for CardTable {}

impl CardTable {
    pub const CARD_CLEAN: u8 = 0x0;
    pub const CARD_DIRTY: u8 = 0x70;
    /// Set on a card once a worker has taken it for remembered set scanning.
    pub const CARD_CLAIMED: u8 = 0x1;

    pub fn new(heap_begin: Address, heap_size: usize) -> std::io::Result<Self> {
        let num_cards = heap_size >> CARD_SHIFT;
        let mut mem_map = MmapMut::map_anon(num_cards.max(1))?;
        let begin = mem_map.as_mut_ptr();
        Ok(Self {
            mem_map,
            begin,
            heap_begin,
            num_cards,
        })
    }

    pub fn mem_map_size(&self) -> usize {
        self.mem_map.len()
    }

    pub fn num_cards(&self) -> usize {
        self.num_cards
    }

    #[inline(always)]
    pub fn index_for(&self, addr: Address) -> usize {
        (addr - self.heap_begin) >> CARD_SHIFT
    }

    #[inline(always)]
    pub fn addr_for(&self, card: usize) -> Address {
        self.heap_begin + (card << CARD_SHIFT)
    }

    #[inline(always)]
    fn byte(&self, card: usize) -> &AtomicU8 {
        debug_assert!(card < self.num_cards);
        unsafe { &*self.begin.add(card).cast::<AtomicU8>() }
    }

    #[inline(always)]
    pub fn get(&self, card: usize) -> u8 {
        self.byte(card).load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set(&self, card: usize, value: u8) {
        self.byte(card).store(value, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_dirty(&self, card: usize) -> bool {
        self.get(card) == Self::CARD_DIRTY
    }

    /// Dirties the card. Returns true if this call made it dirty.
    #[inline(always)]
    pub fn mark_dirty(&self, card: usize) -> bool {
        let current = self.get(card);
        current != Self::CARD_DIRTY
            && byte_cas(current, Self::CARD_DIRTY, unsafe { self.begin.add(card) })
    }

    /// Cleans the card. Returns true if it was dirty.
    #[inline(always)]
    pub fn clean(&self, card: usize) -> bool {
        byte_cas(Self::CARD_DIRTY, Self::CARD_CLEAN, unsafe { self.begin.add(card) })
    }

    /// Claims the card for scanning. Exactly one caller per pause sees true.
    #[inline(always)]
    pub fn claim(&self, card: usize) -> bool {
        self.byte(card).fetch_or(Self::CARD_CLAIMED, Ordering::AcqRel) & Self::CARD_CLAIMED == 0
    }

    pub fn dirty_range(&self, start: Address, end: Address) {
        self.fill(start, end, Self::CARD_DIRTY);
    }

    pub fn clear_range(&self, start: Address, end: Address) {
        self.fill(start, end, Self::CARD_CLEAN);
    }

    fn fill(&self, start: Address, end: Address, value: u8) {
        if end <= start {
            return;
        }
        let first = self.index_for(start);
        let last = self.index_for(end - 1);
        unsafe {
            std::ptr::write_bytes(self.begin.add(first), value, last - first + 1);
        }
    }

    pub fn clear_all(&self) {
        unsafe {
            std::ptr::write_bytes(self.begin, Self::CARD_CLEAN, self.num_cards);
        }
    }

    /// Applies `visitor` to every card covering `[scan_begin, scan_end)` and reports
    /// each card whose value it changed.
    pub fn modify_cards_atomic(
        &self,
        scan_begin: Address,
        scan_end: Address,
        mut visitor: impl FnMut(u8) -> u8,
        mut modified: impl FnMut(usize, u8, u8),
    ) {
        if scan_end <= scan_begin {
            return;
        }
        let first = self.index_for(scan_begin);
        let last = self.index_for(scan_end - 1);
        for card in first..=last {
            let cell = unsafe { self.begin.add(card) };
            let mut expected;
            let mut new_value;
            while {
                expected = self.get(card);
                new_value = visitor(expected);
                expected != new_value && !byte_cas(expected, new_value, cell)
            } {}
            if expected != new_value {
                modified(card, expected, new_value);
            }
        }
    }
}
