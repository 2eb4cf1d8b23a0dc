//! Stop-the-world full collection.
//!
//! Sliding mark-compact over every region that is not humongous and not reserved
//! for popular objects:
//!
//! 1. mark everything reachable from the roots in the mark bitmap;
//! 2. assign each live object its new address, in address order, and store it as
//!    a forwarding mark;
//! 3. redirect every reference through the forwarding marks;
//! 4. slide the objects down and restore their marks.
//!
//! Afterwards every non-empty region is old and dead humongous runs are freed. The
//! remembered sets are discarded and every used card is dirtied again, and the
//! heap is resized to stay within the configured free ratios.

use std::time::Instant;

use crate::address::Address;
use crate::globals::formatted_size;
use crate::header::{fill_range, load_slot, store_slot, walk_objects, ForwardingState, MarkWord, ObjectRef};
use crate::heap::{Heap, HeapState};
use crate::ptr_queue::PtrQueue;
use crate::region::{RegionIndex, RegionKind};
use crate::statistics::{FullGcSummary, GcCause, GcEvent};

pub(crate) fn do_full_collection(heap: &Heap, state: &mut HeapState, cause: GcCause) -> FullGcSummary {
    let start = Instant::now();
    let id = heap.increment_total_collections(true);
    heap.retire_mutator_alloc_region();
    let used_before = heap.used();
    let committed_before = heap.capacity();
    log::debug!("full collection {} ({}) started", id, cause);
    if heap.config.verify_before_gc {
        heap.verify_at_safepoint(state, "before full collection");
    }

    heap.marker.abort(heap, state);
    heap.dirty_cards.abandon_completed_buffers();
    heap.hot_cards.reset();
    heap.popular.clear(&heap.regions);
    state.policy.clear_mixed_candidates();
    for index in state.young_list.empty_list(heap.regions.all()) {
        heap.regions.at(index).set_not_young();
    }

    let live_objects = mark_live_objects(heap);
    let compactible: Vec<RegionIndex> = heap
        .regions
        .iter()
        .filter(|region| region.is_old() && !region.popular())
        .map(|region| region.index())
        .collect();
    let (new_tops, preserved) = compute_new_addresses(heap, &compactible);
    adjust_pointers(heap);
    compact(heap, &compactible, preserved);

    for (index, top) in compactible.iter().zip(new_tops) {
        let region = heap.regions.at(*index);
        if top == region.bottom() {
            region.hr_clear(true);
            continue;
        }
        region.hr_clear(false);
        region.set_kind(RegionKind::Old);
        region.set_top(top);
        walk_objects(region.bottom(), top, |obj| heap.bot.alloc_block(obj.address(), obj.end()));
    }
    let humongous_regions_freed = free_dead_humongous(heap);
    clear_dead_popular_objects(heap);

    heap.marker.bitmap().clear_all();
    heap.card_table.clear_all();
    for region in heap.regions.iter() {
        region.set_ntams(region.bottom());
        region.set_marked_bytes(0);
        region.rem_set().clear();
    }
    redirty_used_regions(heap);

    heap.regions.rebuild_free_lists();
    heap.recompute_used();
    state
        .policy
        .record_full_collection_end(heap.regions.len(), heap.regions.free_regions_count());
    resize_after_full_collection(heap, state);
    if !heap.config.conc_zero_fill {
        // Nobody else cleans the regions compaction emptied.
        let cleaned = heap.regions.move_cleaned_to_free();
        log::debug!("zero-filled {} regions after full collection", cleaned);
    }

    if heap.config.verify_after_gc {
        heap.verify_at_safepoint(state, "after full collection");
    }
    let summary = FullGcSummary {
        id,
        cause,
        live_objects,
        used_before_bytes: used_before,
        used_after_bytes: heap.used(),
        humongous_regions_freed,
        committed_before_bytes: committed_before,
        committed_after_bytes: heap.capacity(),
        pause_time_ms: start.elapsed().as_secs_f64() * 1000.0,
    };
    log::info!("{}", summary);
    heap.fire_event(&GcEvent::FullCollection(summary.clone()));
    summary
}

/// Marks the transitive closure of the roots. Returns the number of live objects.
fn mark_live_objects(heap: &Heap) -> usize {
    let bitmap = heap.marker.bitmap();
    bitmap.clear_all();
    let mut stack: Vec<ObjectRef> = Vec::new();
    heap.visit_roots(&mut |slot: &mut usize| {
        if let Some(obj) = ObjectRef::from_raw(*slot) {
            if bitmap.par_mark(obj.address()) {
                stack.push(obj);
            }
        }
    });
    let mut live = 0;
    while let Some(obj) = stack.pop() {
        live += 1;
        for slot in obj.slots() {
            if let Some(value) = load_slot(slot) {
                if bitmap.par_mark(value.address()) {
                    stack.push(value);
                }
            }
        }
    }
    live
}

/// Assigns new addresses to the live objects of `compactible`, sliding them
/// towards the lowest regions. Returns the new top of each region and the marks
/// to restore, keyed by new address.
fn compute_new_addresses(heap: &Heap, compactible: &[RegionIndex]) -> (Vec<Address>, Vec<(Address, MarkWord)>) {
    let bitmap = heap.marker.bitmap();
    let mut new_tops: Vec<Address> = compactible
        .iter()
        .map(|index| heap.regions.at(*index).bottom())
        .collect();
    let mut preserved = Vec::new();
    let mut dest_pos = 0;
    for index in compactible.iter() {
        let region = heap.regions.at(*index);
        bitmap.visit_marked_range(region.bottom(), region.top(), |addr| {
            let obj = unsafe { ObjectRef::from_address(addr) };
            let words = obj.size_words();
            while new_tops[dest_pos].add_words(words) > heap.regions.at(compactible[dest_pos]).end() {
                dest_pos += 1;
            }
            let dest = new_tops[dest_pos];
            new_tops[dest_pos] = dest.add_words(words);
            let mark = obj.mark();
            if mark.must_be_preserved() {
                preserved.push((dest, mark));
            }
            obj.set_mark(MarkWord::forwarded_to(heap.word_index(dest)));
        });
    }
    (new_tops, preserved)
}

fn adjust_pointers(heap: &Heap) {
    let bitmap = heap.marker.bitmap();
    heap.visit_roots(&mut |slot: &mut usize| {
        if let Some(obj) = ObjectRef::from_raw(*slot) {
            if let ForwardingState::ForwardedTo(word) = obj.forwarding_state() {
                *slot = heap.object_at_word(word).raw();
            }
        }
    });
    for region in heap.regions.iter() {
        if region.is_free() || region.is_continues_humongous() {
            continue;
        }
        bitmap.visit_marked_range(region.bottom(), region.top(), |addr| {
            let obj = unsafe { ObjectRef::from_address(addr) };
            for slot in obj.slots() {
                if let Some(value) = load_slot(slot) {
                    if let ForwardingState::ForwardedTo(word) = value.forwarding_state() {
                        store_slot(slot, Some(heap.object_at_word(word)));
                    }
                }
            }
        });
    }
}

/// Slides every forwarded object to its new address. Objects only move down, so
/// an object is never overwritten before it has been moved itself.
fn compact(heap: &Heap, compactible: &[RegionIndex], preserved: Vec<(Address, MarkWord)>) {
    let bitmap = heap.marker.bitmap();
    let mut moved = 0;
    for index in compactible.iter() {
        let region = heap.regions.at(*index);
        bitmap.visit_marked_range(region.bottom(), region.top(), |addr| {
            let obj = unsafe { ObjectRef::from_address(addr) };
            if let ForwardingState::ForwardedTo(word) = obj.forwarding_state() {
                let words = obj.size_words();
                let dest = heap.object_at_word(word);
                if dest != obj {
                    unsafe {
                        std::ptr::copy(addr.to_ptr::<usize>(), dest.address().to_mut_ptr::<usize>(), words);
                    }
                    moved += 1;
                }
                dest.set_mark(MarkWord::prototype());
            }
        });
    }
    for (addr, mark) in preserved {
        unsafe { ObjectRef::from_address(addr) }.set_mark(mark);
    }
    log::debug!("compaction moved {} objects", moved);
}

/// Frees humongous runs whose object was not marked. Returns the number of regions freed.
fn free_dead_humongous(heap: &Heap) -> usize {
    let bitmap = heap.marker.bitmap();
    let mut freed = 0;
    let regions = heap.regions.all();
    let mut i = 0;
    while i < regions.len() {
        let region = &regions[i];
        i += 1;
        if !region.is_starts_humongous() || bitmap.is_marked(region.bottom()) {
            continue;
        }
        let head = region.index();
        region.hr_clear(true);
        freed += 1;
        while i < regions.len()
            && regions[i].is_continues_humongous()
            && regions[i].humongous_start() == Some(head)
        {
            regions[i].hr_clear(true);
            freed += 1;
            i += 1;
        }
    }
    if freed > 0 {
        log::debug!("freed {} regions of dead humongous objects", freed);
    }
    freed
}

/// Popular regions are never compacted; their dead objects become filler.
fn clear_dead_popular_objects(heap: &Heap) {
    let bitmap = heap.marker.bitmap();
    for region in heap.regions.iter().filter(|region| region.popular()) {
        walk_objects(region.bottom(), region.top(), |obj| {
            if !obj.is_filler() && !bitmap.is_marked(obj.address()) {
                fill_range(obj.address(), obj.end());
            }
        });
    }
}

/// Dirties and logs every card that holds objects. Refinement, at the latest the
/// update of remembered sets at the start of the next evacuation, records the
/// cross-region references of the compacted heap from them.
fn redirty_used_regions(heap: &Heap) {
    let mut queue = PtrQueue::new();
    let mut cards = 0;
    for region in heap.regions.iter() {
        if region.is_free() || region.is_empty() {
            continue;
        }
        heap.card_table.dirty_range(region.bottom(), region.top());
        let first = heap.regions.card_index(region.bottom());
        let last = heap.regions.card_index(region.top() - 1);
        for card in first..=last {
            queue.enqueue(card, &heap.dirty_cards);
        }
        cards += last - first + 1;
    }
    queue.flush(&heap.dirty_cards);
    log::debug!("redirtied {} cards", cards);
}

/// Capacity at which `used` leaves `free_ratio` percent of the heap free.
fn desired_capacity(used: usize, free_ratio: usize) -> usize {
    if free_ratio >= 100 {
        return usize::MAX;
    }
    (used as u128 * 100 / (100 - free_ratio) as u128).min(usize::MAX as u128) as usize
}

fn resize_after_full_collection(heap: &Heap, state: &mut HeapState) {
    let config = &heap.config;
    let used = heap.used();
    let capacity = heap.capacity();
    let minimum_desired = desired_capacity(used, config.min_heap_free_ratio)
        .max(config.initial_heap_size)
        .min(config.max_heap_size);
    let maximum_desired = desired_capacity(used, config.max_heap_free_ratio)
        .max(config.initial_heap_size)
        .min(config.max_heap_size);
    if capacity < minimum_desired {
        let added = heap.expand(state, minimum_desired - capacity);
        log::debug!(
            "full collection: {} used, expanded by {} regions towards {}",
            formatted_size(used),
            added,
            formatted_size(minimum_desired)
        );
    } else if capacity > maximum_desired {
        let removed = heap.shrink(state, capacity - maximum_desired);
        log::debug!(
            "full collection: {} used, shrunk by {} regions towards {}",
            formatted_size(used),
            removed,
            formatted_size(maximum_desired)
        );
    }
}
