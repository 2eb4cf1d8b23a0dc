//! Heap verification.
//!
//! Walks every committed region at a safepoint and checks the invariants the
//! collector relies on. Any violation aborts through [`guarantee!`](crate::guarantee).
//!
//! References are checked only for objects reachable from the roots: dead objects
//! in old regions may still point into regions that have been freed since.

use ahash::RandomState;
use hashbrown::HashSet;

use crate::address::Address;
use crate::card_table::CardTable;
use crate::header::{load_slot, walk_objects, ForwardingState, ObjectRef};
use crate::heap::{Heap, HeapState};
use crate::region::{ListTag, RegionKind};

/// What verification counted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionCensus {
    pub committed: usize,
    /// Regions on the free list.
    pub free: usize,
    /// Regions on the unclean list.
    pub unclean: usize,
    pub young: usize,
    pub survivor: usize,
    /// Old regions, popular ones included.
    pub old: usize,
    pub popular: usize,
    pub humongous: usize,
    /// Non-filler objects found by walking the regions.
    pub objects: usize,
    pub used_bytes: usize,
}

pub(crate) fn verify_heap(heap: &Heap, state: &HeapState) -> RegionCensus {
    let regions = heap.regions.all();
    let (free, unclean) = heap.regions.verify_lists();
    crate::guarantee!(
        state.young_list.check_list_well_formed(regions),
        "young list is malformed"
    );
    crate::guarantee!(state.cset.is_empty(), "collection set is not empty outside a pause");
    let cleanup = heap.barrier.is_cleanup_in_progress();

    let mut census = RegionCensus {
        committed: heap.regions.len(),
        free,
        unclean,
        ..Default::default()
    };
    for region in heap.regions.iter() {
        crate::guarantee!(
            !region.in_collection_set() && !region.evacuation_failed(),
            "{:?} left over from a pause",
            region
        );
        match region.kind() {
            RegionKind::Free => {
                crate::guarantee!(region.is_empty(), "free {:?} is not empty", region);
                crate::guarantee!(
                    cleanup || matches!(region.list_tag(), ListTag::Free | ListTag::Unclean),
                    "free {:?} is on no list",
                    region
                );
                continue;
            }
            RegionKind::Young => census.young += 1,
            RegionKind::Survivor => census.survivor += 1,
            RegionKind::Old => {
                census.old += 1;
                if region.popular() {
                    census.popular += 1;
                }
            }
            RegionKind::StartsHumongous | RegionKind::ContinuesHumongous => census.humongous += 1,
        }
        let expected_tag = if region.is_young() {
            ListTag::Young
        } else {
            ListTag::None
        };
        crate::guarantee!(
            region.list_tag() == expected_tag,
            "{:?} should be tagged {:?}",
            region,
            expected_tag
        );
        census.used_bytes += region.used();

        if region.is_continues_humongous() {
            let head = region.humongous_start();
            crate::guarantee!(
                head.map_or(false, |head| regions[head.as_usize()].is_starts_humongous()),
                "{:?} has no humongous head",
                region
            );
            continue;
        }
        walk_objects(region.bottom(), region.top(), |obj| {
            if obj.is_filler() {
                return;
            }
            census.objects += 1;
            crate::guarantee!(
                obj.forwarding_state() == ForwardingState::NotForwarded,
                "{:?} is still forwarded: {:?}",
                obj,
                obj.mark()
            );
        });
    }
    verify_reachable(heap);

    crate::guarantee!(
        census.young + census.survivor == state.young_list.length(),
        "{} young and survivor regions but the young list has {}",
        census.young + census.survivor,
        state.young_list.length()
    );
    crate::guarantee!(
        census.used_bytes == heap.used(),
        "regions hold {} bytes but the heap accounts {}",
        census.used_bytes,
        heap.used()
    );
    census
}

/// Traces the object graph from the roots, checking every reference it follows.
fn verify_reachable(heap: &Heap) {
    let mut visited: HashSet<ObjectRef, RandomState> = HashSet::with_hasher(RandomState::new());
    let mut stack = Vec::new();
    heap.visit_roots(&mut |slot: &mut usize| {
        if let Some(obj) = ObjectRef::from_raw(*slot) {
            verify_reference(heap, Address::from_usize(slot as *mut usize as usize), obj);
            if visited.insert(obj) {
                stack.push(obj);
            }
        }
    });
    while let Some(obj) = stack.pop() {
        for slot in obj.slots() {
            if let Some(value) = load_slot(slot) {
                verify_reference(heap, slot, value);
                verify_remembered(heap, slot, value);
                if visited.insert(value) {
                    stack.push(value);
                }
            }
        }
    }
}

/// A cross-region reference stored in an old or humongous region is either in the
/// target's remembered set or sits on a card still waiting for refinement.
fn verify_remembered(heap: &Heap, slot: Address, value: ObjectRef) {
    let regions = &heap.regions;
    let source = regions.addr_to_region(slot);
    if !(source.is_old() || source.is_humongous()) {
        return;
    }
    let target = regions.addr_to_region(value.address());
    if target.index() == source.index() || target.popular() || target.is_humongous() {
        return;
    }
    let card = regions.card_index(slot);
    crate::guarantee!(
        heap.card_table.get(card) != CardTable::CARD_CLEAN || target.rem_set().contains_reference(card),
        "remembered set of {:?} misses card {} holding {:?} -> {:?}",
        target,
        card,
        slot,
        value
    );
}

fn verify_reference(heap: &Heap, slot: Address, value: ObjectRef) {
    crate::guarantee!(
        heap.regions.is_in_committed(value.address()),
        "slot {:?} points outside the committed heap: {:?}",
        slot,
        value
    );
    let target = heap.regions.addr_to_region(value.address());
    crate::guarantee!(
        !target.is_free() && value.address() < target.top(),
        "slot {:?} points into unused space of {:?}: {:?}",
        slot,
        target,
        value
    );
}
