//! Remembered set refinement.
//!
//! The post-write barrier of a mutator logs every card it dirties with a
//! cross-region store. Completed logs are refined here: the card is cleaned, its
//! memory scanned, and every pointer into another region recorded in that region's
//! remembered set. The refinement thread does this between pauses; during a pause
//! the GC workers drain whatever is left before they scan remembered sets.

use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::address::Address;
use crate::globals::{CARD_SIZE, HEADER_WORDS};
use crate::header::{load_slot, ObjectRef};
use crate::heap::Heap;

/// Cards refined over and over are deferred here and refined once they drop out.
///
/// The per-card counts live in an anonymous map parallel to the card table.
pub struct HotCardCache {
    counts: MmapMut,
    counts_begin: *const AtomicU8,
    num_cards: usize,
    ring: Mutex<VecDeque<usize>>,
    capacity: usize,
    hot_limit: u8,
}

unsafe impl Send for HotCardCache {}
unsafe impl Sync for HotCardCache {}

impl HotCardCache {
    pub fn new(num_cards: usize, log_size: usize, hot_limit: u8) -> std::io::Result<Self> {
        let capacity = if log_size == 0 { 0 } else { 1 << log_size };
        let mut counts = MmapMut::map_anon(num_cards.max(1))?;
        let counts_begin = counts.as_mut_ptr() as *const AtomicU8;
        Ok(Self {
            counts,
            counts_begin,
            num_cards,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            hot_limit,
        })
    }

    pub fn use_cache(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn count(&self, card: usize) -> &AtomicU8 {
        debug_assert!(card < self.num_cards);
        unsafe { &*self.counts_begin.add(card) }
    }

    pub fn card_count(&self, card: usize) -> u8 {
        self.count(card).load(Ordering::Relaxed)
    }

    /// Counts a refinement of `card`. Returns the card to refine right away: `card`
    /// itself while it is cold, or the card it pushed out of the ring, if any.
    pub fn insert(&self, card: usize) -> Option<usize> {
        if !self.use_cache() {
            return Some(card);
        }
        let count = self.count(card);
        let previous = count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c.saturating_add(1)))
            .unwrap_or(u8::MAX);
        if previous < self.hot_limit {
            return Some(card);
        }
        let mut ring = self.ring.lock();
        if ring.contains(&card) {
            return None;
        }
        let evicted = if ring.len() == self.capacity {
            ring.pop_front()
        } else {
            None
        };
        ring.push_back(card);
        evicted
    }

    /// Takes every deferred card.
    pub fn drain(&self) -> Vec<usize> {
        self.ring.lock().drain(..).collect()
    }

    /// Forgets all counts and deferred cards.
    pub fn reset(&self) {
        self.ring.lock().clear();
        self.reset_counts();
    }

    pub fn reset_counts(&self) {
        unsafe {
            std::ptr::write_bytes(self.counts_begin as *mut u8, 0, self.num_cards);
        }
    }

    pub fn mem_map_size(&self) -> usize {
        self.counts.len()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RefineStats {
    pub cards_refined: usize,
    pub cards_skipped: usize,
    pub refs_recorded: usize,
}

impl RefineStats {
    pub fn merge(&mut self, other: &RefineStats) {
        self.cards_refined += other.cards_refined;
        self.cards_skipped += other.cards_skipped;
        self.refs_recorded += other.refs_recorded;
    }
}

/// Records that the reference stored at `slot` points to `value`.
///
/// Nothing is recorded for references within a region or into regions that are
/// never evacuated. Returns true if a new entry was added.
pub fn record_reference(heap: &Heap, slot: Address, value: ObjectRef) -> bool {
    let regions = &heap.regions;
    if !regions.is_in_committed(value.address()) {
        return false;
    }
    let from = regions.index_of(slot);
    let target = regions.addr_to_region(value.address());
    if target.index() == from || target.popular() || target.is_humongous() || target.is_free() {
        return false;
    }
    let added = target.rem_set().add_reference(regions.card_index(slot));
    if added && heap.popular.enabled() && target.is_old() {
        heap.popular.maybe_schedule(target);
    }
    added
}

/// Cleans `card` and records the cross-region pointers stored on it.
///
/// Cards outside old and humongous regions are left alone: young cards stay dirty
/// and free regions hold nothing worth recording. During a pause, regions that
/// received copies are scanned only up to the top they had when copying started.
pub fn refine_card(heap: &Heap, card: usize, during_gc: bool, stats: &mut RefineStats) {
    let regions = &heap.regions;
    let start = regions.card_start(card);
    if !regions.is_in_committed(start) {
        stats.cards_skipped += 1;
        return;
    }
    let region = regions.addr_to_region(start);
    if !(region.is_old() || region.is_humongous()) || region.in_collection_set() {
        stats.cards_skipped += 1;
        return;
    }
    if !heap.card_table.clean(card) {
        stats.cards_skipped += 1;
        return;
    }
    // Pairs with the fence in the post-write barrier: either the mutator sees
    // the clean card and logs it again, or we see its store.
    fence(Ordering::SeqCst);

    let top = if during_gc {
        region.scan_top(heap.gc_time_stamp())
    } else {
        region.top()
    };
    let card_end = (start + CARD_SIZE).min(top);
    if start >= card_end {
        stats.cards_refined += 1;
        return;
    }
    let bottom = match region.humongous_start() {
        Some(head) if region.is_continues_humongous() => regions.at(head).bottom(),
        _ => region.bottom(),
    };
    let mut obj = heap.bot.object_containing(bottom, start);
    while obj.address() < card_end {
        for_each_slot_in(obj, start, card_end, |slot| {
            if let Some(value) = load_slot(slot) {
                if record_reference(heap, slot, value) {
                    stats.refs_recorded += 1;
                }
            }
        });
        obj = unsafe { ObjectRef::from_address(obj.end()) };
    }
    stats.cards_refined += 1;
}

/// Applies `f` to the reference slots of `obj` that lie in `[from, to)`.
#[inline]
pub(crate) fn for_each_slot_in(obj: ObjectRef, from: Address, to: Address, mut f: impl FnMut(Address)) {
    let count = obj.ref_count();
    if count == 0 {
        return;
    }
    let first = obj.address().add_words(HEADER_WORDS);
    let begin = if from > first { from.words_from(first).min(count) } else { 0 };
    let end = if to > first { to.words_from(first).min(count) } else { 0 };
    for i in begin..end {
        f(first.add_words(i));
    }
}

/// Refines a completed buffer of cards, routing them through the hot card cache
/// when `use_hot_cache` is set.
pub fn refine_buffer(heap: &Heap, cards: &[usize], use_hot_cache: bool, stats: &mut RefineStats) {
    for &card in cards {
        let card = if use_hot_cache {
            match heap.hot_cards.insert(card) {
                Some(card) => card,
                None => continue,
            }
        } else {
            card
        };
        refine_card(heap, card, false, stats);
    }
}

/// Body of the concurrent refinement thread.
pub(crate) fn refinement_thread(heap: Arc<Heap>) {
    heap.safepoint.register();
    let mut stats = RefineStats::default();
    log::debug!("refinement thread started");
    while !heap.is_shutting_down() {
        {
            let _safe = heap.safepoint.enter_safe_region();
            heap.dirty_cards
                .wait_for_work(&heap.shutdown, Duration::from_millis(50));
        }
        if !heap.dirty_cards.process_completed_buffers() {
            continue;
        }
        // Poll between buffers only; a buffer is refined as a whole.
        while !heap.is_shutting_down() {
            match heap.dirty_cards.take_completed_buffer() {
                Some(buf) => refine_buffer(&heap, &buf, true, &mut stats),
                None => break,
            }
            if heap.safepoint.is_armed() {
                heap.safepoint.park();
            }
        }
    }
    log::debug!(
        "refinement thread stopped: {} cards refined, {} skipped, {} references recorded",
        stats.cards_refined,
        stats.cards_skipped,
        stats.refs_recorded
    );
    heap.safepoint.unregister();
}
