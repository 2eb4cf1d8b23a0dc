//! Incremental evacuation pauses.
//!
//! A pause runs with the world stopped and the heap lock held. It picks the
//! collection set (all young regions, old candidates after a marking cycle, and a
//! queued popular region), evacuates it, frees what was evacuated, turns regions
//! that failed evacuation into old regions and finally lets the policy size the
//! next young generation and decide whether a marking cycle starts.

use std::time::Instant;

use crate::address::Address;
use crate::allocation::GcAllocPurpose;
use crate::evacuation::failure::{remove_self_forwarding_pointers, restore_preserved_marks};
use crate::evacuation::{evacuate_collection_set, EvacuationOutcome, EvacuationRequest};
use crate::globals::HEAP_WORD_SIZE;
use crate::header::{fill_range, MarkWord, ObjectRef};
use crate::heap::{Heap, HeapState};
use crate::policy::PauseRecord;
use crate::popular::{allocate_in_popular_regions, find_popular_objects};
use crate::region::{Region, RegionIndex};
use crate::statistics::{GcCause, GcEvent, PauseKind, PauseSummary};

/// Runs one incremental pause. Only at a safepoint, with the heap lock held.
pub(crate) fn do_collection_pause(heap: &Heap, state: &mut HeapState, cause: GcCause) -> PauseSummary {
    let start = Instant::now();
    let id = heap.increment_total_collections(false);
    heap.retire_mutator_alloc_region();
    let used_before = heap.used();
    heap.fire_event(&GcEvent::PausePrologue {
        id,
        cause,
        used_bytes: used_before,
    });
    if heap.config.verify_before_gc {
        heap.verify_at_safepoint(state, "before pause");
    }

    let stamp = heap.increment_gc_time_stamp();
    state.policy.record_collection_pause_start();
    let marking = heap.marker.is_marking();
    if marking {
        heap.marker.drain_satb_at_pause(heap);
    }

    let regions = heap.regions.all();
    let free_regions = heap.regions.free_regions_count();
    let pending_cards = heap.dirty_cards.completed_buffers() * heap.dirty_cards.buffer_size();
    {
        let HeapState {
            policy,
            young_list,
            cset,
        } = &mut *state;
        policy.choose_collection_set(regions, young_list, cset, pending_cards, free_regions);
    }
    let mut kind = if state.cset.old_regions() > 0 {
        PauseKind::Mixed
    } else {
        PauseKind::Young
    };

    let mut initial_slots = Vec::new();
    let mut popular_objects = 0;
    if heap.popular.enabled() {
        if let Some(index) = heap.popular.popular_region_to_evac(&heap.regions) {
            let region = heap.regions.at(index);
            popular_objects = evacuate_popular_objects(heap, region, marking, &mut initial_slots);
            let predicted = state.policy.predict_region_time_ms(region);
            state.cset.add(regions, index, predicted);
            kind = PauseKind::Popular;
        }
    }

    if state.cset.is_empty() {
        return abandon_pause(heap, state, id, cause, used_before, start);
    }

    let cset_indices = state.cset.indices(regions);
    let scan_only: Vec<RegionIndex> = state
        .young_list
        .scan_only_iter(regions)
        .map(|region| region.index())
        .collect();
    let cs_young_regions = state.cset.young_regions();
    heap.gc_alloc.prepare(
        [
            state.policy.max_regions(GcAllocPurpose::Survived),
            state.policy.max_regions(GcAllocPurpose::Tenured),
        ],
        stamp,
    );
    let outcome = evacuate_collection_set(
        heap,
        EvacuationRequest {
            cset: &cset_indices,
            scan_only: &scan_only,
            young_cset_regions: cs_young_regions,
            destination: state.policy.destination_rule(),
            marking,
            stamp,
            initial_slots,
        },
    );

    log::trace!(
        "GC allocation regions at the end of evacuation: {:?}",
        heap.gc_alloc.get_gc_alloc_regions()
    );
    for (purpose, index) in heap.gc_alloc.release() {
        if purpose == GcAllocPurpose::Survived {
            state.young_list.add_survivor_region(regions, index);
        }
        if marking {
            heap.regions.at(index).note_end_of_copying();
        }
    }

    let failed_regions = if outcome.evacuation_failed {
        remove_self_forwarding_pointers(heap, &cset_indices, marking)
    } else {
        0
    };
    let EvacuationOutcome {
        bytes_copied,
        objects_copied,
        self_forwarded,
        evacuation_failed,
        age_table,
        surviving_words,
        preserved_marks,
        refine,
        rs_cards_scanned,
        update_rs_time_ms,
        ..
    } = outcome;
    restore_preserved_marks(preserved_marks);

    let cs_regions = state.cset.len();
    let regions_freed = free_collection_set(heap, state, &surviving_words, marking);
    {
        let HeapState {
            policy, young_list, ..
        } = &mut *state;
        young_list.reset_auxiliary_lists(regions, policy.surv_rate_group());
    }
    heap.recompute_used();

    // Young cards stay dirty; every other card was refined or scanned by now.
    heap.card_table.clear_all();
    for region in state.young_list.iter(regions) {
        heap.card_table.dirty_range(region.bottom(), region.end());
    }
    heap.hot_cards.reset_counts();

    state.policy.record_age_table(&age_table);
    let used_after = heap.used();
    let young_bytes: usize = state.young_list.iter(regions).map(|region| region.used()).sum();
    let pause_time_ms = start.elapsed().as_secs_f64() * 1000.0;
    let decision = state.policy.record_collection_pause_end(&PauseRecord {
        pause_time_ms,
        update_rs_time_ms,
        cards_processed: refine.cards_refined,
        rs_cards_scanned,
        bytes_copied,
        cs_regions,
        cs_young_regions,
        free_regions: heap.regions.free_regions_count(),
        young_length: state.young_list.length(),
        old_used_bytes: used_after.saturating_sub(young_bytes),
        committed_bytes: heap.capacity(),
        evacuation_failed,
        abandoned: false,
    });

    let initiated_conc_mark = decision.initiate_conc_mark && !heap.marker.is_marking();
    if initiated_conc_mark {
        heap.marker.checkpoint_roots_initial(heap, state);
    }
    if decision.expand_bytes > 0 {
        heap.expand(state, decision.expand_bytes);
    }
    if heap.config.verify_after_gc {
        heap.verify_at_safepoint(state, "after pause");
    }

    let summary = PauseSummary {
        id,
        cause,
        kind,
        cs_regions,
        cs_young_regions,
        scan_only_regions: scan_only.len(),
        regions_freed,
        failed_regions,
        evacuation_failed,
        objects_copied,
        self_forwarded,
        bytes_copied,
        used_before_bytes: used_before,
        used_after_bytes: used_after,
        popular_objects,
        initiated_conc_mark,
        pause_time_ms,
    };
    log::info!("{}", summary);
    heap.fire_event(&GcEvent::PauseEpilogue(summary.clone()));
    summary
}

/// Nothing fit into the pause. The young list is rebuilt from what is left and
/// the policy records the pause without timing data.
fn abandon_pause(
    heap: &Heap,
    state: &mut HeapState,
    id: usize,
    cause: GcCause,
    used_before: usize,
    start: Instant,
) -> PauseSummary {
    let regions = heap.regions.all();
    {
        let HeapState {
            policy, young_list, ..
        } = &mut *state;
        young_list.reset_auxiliary_lists(regions, policy.surv_rate_group());
    }
    heap.recompute_used();
    let pause_time_ms = start.elapsed().as_secs_f64() * 1000.0;
    let used_after = heap.used();
    state.policy.record_collection_pause_end(&PauseRecord {
        pause_time_ms,
        free_regions: heap.regions.free_regions_count(),
        young_length: state.young_list.length(),
        old_used_bytes: used_after,
        committed_bytes: heap.capacity(),
        abandoned: true,
        ..Default::default()
    });
    let summary = PauseSummary {
        id,
        cause,
        kind: PauseKind::Abandoned,
        cs_regions: 0,
        cs_young_regions: 0,
        scan_only_regions: state.young_list.scan_only_length(),
        regions_freed: 0,
        failed_regions: 0,
        evacuation_failed: false,
        objects_copied: 0,
        self_forwarded: 0,
        bytes_copied: 0,
        used_before_bytes: used_before,
        used_after_bytes: used_after,
        popular_objects: 0,
        initiated_conc_mark: false,
        pause_time_ms,
    };
    log::info!("{}", summary);
    heap.fire_event(&GcEvent::PauseEpilogue(summary.clone()));
    summary
}

/// Empties the collection set. Evacuated regions are freed; regions that failed
/// stay in place as old regions. Returns the number of regions freed.
fn free_collection_set(heap: &Heap, state: &mut HeapState, surviving_words: &[usize], marking: bool) -> usize {
    let regions = heap.regions.all();
    let members = state.cset.clear(regions);
    let mut freed = Vec::with_capacity(members.len());
    for index in members {
        let region = heap.regions.at(index);
        if region.is_young() {
            let young_index = region.young_index_in_cset();
            let surviving = if young_index >= 0 {
                surviving_words
                    .get(young_index as usize)
                    .copied()
                    .unwrap_or(0)
            } else {
                0
            };
            state.policy.record_region_survival(
                region.surv_rate_age(),
                region.used() / HEAP_WORD_SIZE,
                surviving,
            );
        }
        if region.evacuation_failed() {
            region.set_not_young();
            region.set_evacuation_failed(false);
            continue;
        }
        if marking {
            heap.marker.bitmap().clear_range(region.bottom(), region.end());
        }
        freed.push(index);
    }
    heap.regions.free_regions(&freed);
    freed.len()
}

/// Moves the objects of `region` that too many old regions point to into the
/// reserved popular regions and forwards the originals there. Evacuation then
/// redirects every reference it meets, and the copies' own referents are traced
/// from `slots`.
fn evacuate_popular_objects(heap: &Heap, region: &Region, marking: bool, slots: &mut Vec<Address>) -> usize {
    let objects = find_popular_objects(heap, region, heap.popular.obj_pop_limit());
    if objects.is_empty() {
        let limit = heap.popular.double_rs_pop_limit();
        log::debug!(
            "region {} has no popular objects; remembered set limit raised to {}",
            region.index(),
            limit
        );
        return 0;
    }
    let mut relocated = 0;
    for obj in objects {
        let words = obj.size_words();
        let dest = match allocate_in_popular_regions(heap, words) {
            Some(dest) => dest,
            None => {
                log::debug!("popular regions exhausted after {} objects", relocated);
                break;
            }
        };
        let prev = match obj.forward_atomic(MarkWord::forwarded_to(heap.word_index(dest))) {
            Ok(prev) => prev,
            Err(_) => {
                fill_range(dest, dest.add_words(words));
                continue;
            }
        };
        unsafe {
            std::ptr::copy_nonoverlapping(obj.address().to_ptr::<usize>(), dest.to_mut_ptr::<usize>(), words);
        }
        let copy = unsafe { ObjectRef::from_address(dest) };
        copy.set_mark(prev);
        if marking && heap.marker.is_live(region, obj) {
            heap.marker.bitmap().par_mark(dest);
        }
        slots.extend(copy.slots());
        relocated += 1;
    }
    log::debug!(
        "relocated {} popular objects out of region {}",
        relocated,
        region.index()
    );
    relocated
}
