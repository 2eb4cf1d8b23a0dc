use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;

use crate::address::Address;
use crate::globals::{CARD_SHIFT, CARD_SIZE_IN_WORDS};
use crate::header::ObjectRef;

/// Maps every card to the start of the block covering the card's first word.
///
/// Blocks are recorded for allocations into regions whose cards get scanned:
/// promotion buffers and direct copies in old regions, humongous objects and the
/// object walk done when a region is turned into an old region in place. Entries
/// for cards at or above a region's top are meaningless and never consulted.
pub struct BlockOffsetTable {
    mem_map: MmapMut,
    entries: *const AtomicU32,
    heap_begin: Address,
    num_cards: usize,
}

unsafe impl Send for BlockOffsetTable {}
unsafe impl Sync for BlockOffsetTable {}

impl BlockOffsetTable {
    pub fn new(heap_begin: Address, heap_size: usize) -> std::io::Result<Self> {
        let num_cards = heap_size >> CARD_SHIFT;
        let mut mem_map = MmapMut::map_anon((num_cards * 4).max(4))?;
        let entries = mem_map.as_mut_ptr() as *const AtomicU32;
        Ok(Self {
            mem_map,
            entries,
            heap_begin,
            num_cards,
        })
    }

    pub fn mem_map_size(&self) -> usize {
        self.mem_map.len()
    }

    #[inline(always)]
    fn entry(&self, card: usize) -> &AtomicU32 {
        debug_assert!(card < self.num_cards);
        unsafe { &*self.entries.add(card) }
    }

    #[inline(always)]
    fn card_of(&self, addr: Address) -> usize {
        (addr - self.heap_begin) >> CARD_SHIFT
    }

    /// Records the block `[start, end)`.
    pub fn alloc_block(&self, start: Address, end: Address) {
        if end <= start {
            return;
        }
        let word = start.words_from(self.heap_begin) as u32;
        let mut card = self.card_of(start);
        if (start.words_from(self.heap_begin)) % CARD_SIZE_IN_WORDS != 0 {
            card += 1;
        }
        let last = self.card_of(end - 1);
        while card <= last {
            self.entry(card).store(word, Ordering::Release);
            card += 1;
        }
    }

    /// Start of the block covering the first word of the card that contains `addr`.
    #[inline]
    pub fn block_start_for_card(&self, addr: Address) -> Address {
        let word = self.entry(self.card_of(addr)).load(Ordering::Acquire) as usize;
        self.heap_begin.add_words(word)
    }

    /// The object containing `addr`, found by walking forward from the block start.
    /// `bottom` bounds the walk from below for the region's first card.
    pub fn object_containing(&self, bottom: Address, addr: Address) -> ObjectRef {
        let mut cur = self.block_start_for_card(addr).max(bottom);
        loop {
            let obj = unsafe { ObjectRef::from_address(cur) };
            let end = obj.end();
            if end > addr {
                return obj;
            }
            cur = end;
        }
    }
}
