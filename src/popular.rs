//! Popular regions.
//!
//! A region whose remembered set grows past `rs_pop_limit` is expensive to
//! evacuate: every card recorded in it has to be scanned. Such a region is queued
//! here and the next pause adds it to its collection set, after first relocating the
//! objects responsible for most incoming references into the regions reserved for
//! popular objects. References into reserved regions are never recorded and the
//! reserved regions are never evacuated, so those objects stop costing anything.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::address::Address;
use crate::globals::CARD_SIZE;
use crate::header::{load_slot, ObjectRef};
use crate::heap::Heap;
use crate::refine::for_each_slot_in;
use crate::region::{Region, RegionIndex};
use crate::region_directory::RegionDirectory;

/// Upper bound of the popularity limit when it keeps doubling.
const MAX_RS_POP_LIMIT: usize = 1 << 30;

pub struct PopularRegions {
    reserved: usize,
    queue: Mutex<VecDeque<RegionIndex>>,
    rs_pop_limit: AtomicUsize,
    obj_pop_limit: u32,
}

impl PopularRegions {
    pub fn new(reserved: usize, rs_pop_limit: usize, obj_pop_limit: u32) -> Self {
        Self {
            reserved,
            queue: Mutex::new(VecDeque::new()),
            rs_pop_limit: AtomicUsize::new(rs_pop_limit.max(1)),
            obj_pop_limit: obj_pop_limit.max(1),
        }
    }

    #[inline(always)]
    pub fn enabled(&self) -> bool {
        self.reserved > 0
    }

    /// Number of regions reserved for popular objects. They are the first ones.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn rs_pop_limit(&self) -> usize {
        self.rs_pop_limit.load(Ordering::Relaxed)
    }

    pub fn obj_pop_limit(&self) -> u32 {
        self.obj_pop_limit
    }

    /// A popularity pass found nothing worth relocating; make the next one rarer.
    pub fn double_rs_pop_limit(&self) -> usize {
        let limit = self.rs_pop_limit();
        let doubled = if limit < MAX_RS_POP_LIMIT { limit * 2 } else { limit };
        self.rs_pop_limit.store(doubled, Ordering::Relaxed);
        doubled
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Queues `region` if its remembered set crossed the limit.
    pub fn maybe_schedule(&self, region: &Region) {
        if region.rem_set().occupied() <= self.rs_pop_limit()
            || region.popular_pending()
            || region.in_collection_set()
            || region.popular()
        {
            return;
        }
        self.schedule_popular_region_evac(region);
    }

    pub fn schedule_popular_region_evac(&self, region: &Region) {
        let mut queue = self.queue.lock();
        if region.popular_pending() {
            return;
        }
        region.set_popular_pending(true);
        queue.push_back(region.index());
        log::debug!(
            "scheduled popular region {} with {} remembered cards",
            region.index(),
            region.rem_set().occupied()
        );
    }

    /// Next queued region that is still popular. Regions whose remembered set
    /// shrank below the limit since they were queued are dropped.
    pub fn popular_region_to_evac(&self, regions: &RegionDirectory) -> Option<RegionIndex> {
        let mut queue = self.queue.lock();
        while let Some(index) = queue.pop_front() {
            let region = regions.at(index);
            region.set_popular_pending(false);
            if !region.is_old() || region.in_collection_set() {
                continue;
            }
            if region.rem_set().occupied() < self.rs_pop_limit() {
                log::debug!("region {} is no longer popular", index);
                continue;
            }
            return Some(index);
        }
        None
    }

    pub fn clear(&self, regions: &RegionDirectory) {
        let mut queue = self.queue.lock();
        for index in queue.drain(..) {
            regions.at(index).set_popular_pending(false);
        }
    }
}

/// Counts references into `region` from the old and humongous cards of its
/// remembered set, saturating at `limit`, and returns the objects that reached it.
pub fn find_popular_objects(heap: &Heap, region: &Region, limit: u32) -> Vec<ObjectRef> {
    let regions = &heap.regions;
    let mut counts: HashMap<usize, u32, RandomState> = HashMap::with_hasher(RandomState::new());
    for card in region.rem_set().cards() {
        let start = regions.card_start(card);
        if !regions.is_in_committed(start) {
            continue;
        }
        let source = regions.addr_to_region(start);
        if !(source.is_old() || source.is_humongous()) || source.index() == region.index() {
            continue;
        }
        let card_end = (start + CARD_SIZE).min(source.top());
        if start >= card_end {
            continue;
        }
        let bottom = match source.humongous_start() {
            Some(head) if source.is_continues_humongous() => regions.at(head).bottom(),
            _ => source.bottom(),
        };
        let mut obj = heap.bot.object_containing(bottom, start);
        while obj.address() < card_end {
            for_each_slot_in(obj, start, card_end, |slot| {
                if let Some(value) = load_slot(slot) {
                    if region.contains(value.address()) {
                        let count = counts.entry(value.raw()).or_insert(0);
                        if *count < limit {
                            *count += 1;
                        }
                    }
                }
            });
            obj = unsafe { ObjectRef::from_address(obj.end()) };
        }
    }
    let mut popular: Vec<ObjectRef> = counts
        .into_iter()
        .filter(|(_, count)| *count >= limit)
        .filter_map(|(raw, _)| ObjectRef::from_raw(raw))
        .collect();
    popular.sort();
    popular
}

/// First-fit allocation in the reserved popular regions.
pub fn allocate_in_popular_regions(heap: &Heap, words: usize) -> Option<Address> {
    let reserved = heap.popular.reserved().min(heap.regions.len());
    for i in 0..reserved {
        let region = heap.regions.at(RegionIndex(i as u32));
        if let Some(addr) = region.par_allocate(words) {
            heap.bot.alloc_block(addr, addr.add_words(words));
            return Some(addr);
        }
    }
    None
}
