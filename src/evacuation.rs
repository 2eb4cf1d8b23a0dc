//! Parallel evacuation of the collection set.
//!
//! Every GC worker runs two phases separated by a barrier. In the first, the
//! workers drain the dirty card queue so that the remembered sets are complete.
//! In the second, each worker scans its share of the roots and of the remembered
//! sets of the collection set, copies every object it finds there and then traces
//! the copies through its own work queue, stealing from the others when it runs
//! dry. Objects that cannot be copied are forwarded to themselves and their
//! regions stay in place (see [`failure`]).

pub mod failure;
pub mod scan_state;
pub mod terminator;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use crossbeam::deque::{Stealer, Worker};
use parking_lot::Mutex;

use crate::address::Address;
use crate::header::{MarkWord, ObjectRef};
use crate::heap::Heap;
use crate::policy::age_table::AgeTable;
use crate::policy::DestinationRule;
use crate::refine::RefineStats;
use crate::region::RegionIndex;
use crate::roots::RootSet;
use scan_state::{ScanState, ScanTask};
use terminator::Terminator;

/// Shared, read-mostly state of one evacuation.
pub(crate) struct EvacuationContext<'a> {
    pub heap: &'a Heap,
    pub stamp: u32,
    pub marking: bool,
    pub destination: DestinationRule,
    pub plab_words: usize,
    pub waste_percent: usize,
    pub array_chunk: usize,
    pub young_cset_regions: usize,
    pub cset: &'a [RegionIndex],
    pub scan_only: &'a [RegionIndex],
    pub thread_roots: &'a [Arc<RootSet>],
    /// Entries of the global mark stack, updated in place like any other root.
    pub mark_stack: &'a [AtomicUsize],
    pub stealers: Vec<Stealer<ScanTask>>,
    pub terminator: Terminator,
    pub phase_barrier: Barrier,
    pub next_thread_root: AtomicUsize,
    pub next_mark_chunk: AtomicUsize,
    pub next_scan_only: AtomicUsize,
    pub evacuation_failed: AtomicBool,
}

/// What an evacuation did, summed over all workers.
#[derive(Debug, Default)]
pub struct EvacuationOutcome {
    pub bytes_copied: usize,
    pub objects_copied: usize,
    pub self_forwarded: usize,
    pub evacuation_failed: bool,
    pub age_table: AgeTable,
    /// Words copied out of each young region, by its index in the collection set.
    pub surviving_words: Vec<usize>,
    pub preserved_marks: Vec<(ObjectRef, MarkWord)>,
    pub refine: RefineStats,
    pub rs_cards_scanned: usize,
    pub update_rs_time_ms: f64,
    pub steals: usize,
    pub overflowed: usize,
    pub plab_waste_words: usize,
}

impl EvacuationOutcome {
    fn merge(&mut self, other: EvacuationOutcome) {
        self.bytes_copied += other.bytes_copied;
        self.objects_copied += other.objects_copied;
        self.self_forwarded += other.self_forwarded;
        self.evacuation_failed |= other.evacuation_failed;
        self.age_table.merge(&other.age_table);
        if self.surviving_words.len() < other.surviving_words.len() {
            self.surviving_words.resize(other.surviving_words.len(), 0);
        }
        for (mine, theirs) in self.surviving_words.iter_mut().zip(other.surviving_words) {
            *mine += theirs;
        }
        self.preserved_marks.extend(other.preserved_marks);
        self.refine.merge(&other.refine);
        self.rs_cards_scanned += other.rs_cards_scanned;
        self.update_rs_time_ms = self.update_rs_time_ms.max(other.update_rs_time_ms);
        self.steals += other.steals;
        self.overflowed += other.overflowed;
        self.plab_waste_words += other.plab_waste_words;
    }
}

/// Everything a pause hands to the evacuation engine.
pub(crate) struct EvacuationRequest<'a> {
    pub cset: &'a [RegionIndex],
    pub scan_only: &'a [RegionIndex],
    pub young_cset_regions: usize,
    pub destination: DestinationRule,
    pub marking: bool,
    pub stamp: u32,
    /// Reference slots to trace before anything else.
    pub initial_slots: Vec<Address>,
}

/// Evacuates the collection set. Runs at a safepoint with the heap lock held.
pub(crate) fn evacuate_collection_set(heap: &Heap, request: EvacuationRequest<'_>) -> EvacuationOutcome {
    let thread_roots: Vec<Arc<RootSet>> = heap.thread_roots.lock().clone();
    let mark_stack: Vec<AtomicUsize> = if request.marking {
        heap.marker
            .take_stack()
            .into_iter()
            .map(AtomicUsize::new)
            .collect()
    } else {
        Vec::new()
    };
    heap.regions.reset_claim_values();

    let mut pool = heap.workers.lock();
    let n_workers = pool.thread_count().max(1) as usize;
    let config = &heap.config;
    let workers: Vec<Worker<ScanTask>> = (0..n_workers).map(|_| Worker::new_lifo()).collect();
    let ctx = EvacuationContext {
        heap,
        stamp: request.stamp,
        marking: request.marking,
        destination: request.destination,
        plab_words: (config.gc_alloc_buffer_size / crate::globals::HEAP_WORD_SIZE)
            .max(crate::globals::MIN_OBJ_ALIGNMENT_WORDS),
        waste_percent: config.gc_alloc_buffer_waste_percent,
        array_chunk: config.array_scan_chunk,
        young_cset_regions: request.young_cset_regions,
        cset: request.cset,
        scan_only: request.scan_only,
        thread_roots: &thread_roots,
        mark_stack: &mark_stack,
        stealers: workers.iter().map(|w| w.stealer()).collect(),
        terminator: Terminator::new(n_workers),
        phase_barrier: Barrier::new(n_workers),
        next_thread_root: AtomicUsize::new(0),
        next_mark_chunk: AtomicUsize::new(0),
        next_scan_only: AtomicUsize::new(0),
        evacuation_failed: AtomicBool::new(false),
    };
    let results: Mutex<Vec<EvacuationOutcome>> = Mutex::new(Vec::with_capacity(n_workers));
    let mut initial_slots = Some(request.initial_slots);

    pool.scoped(|scope| {
        for (worker_id, queue) in workers.into_iter().enumerate() {
            let ctx = &ctx;
            let results = &results;
            let initial = if worker_id == 0 {
                initial_slots.take().unwrap_or_default()
            } else {
                Vec::new()
            };
            scope.execute(move || {
                let mut state = ScanState::new(ctx, worker_id, queue);
                state.run(&initial);
                results.lock().push(state.finish());
            });
        }
    });
    drop(pool);

    if request.marking {
        heap.marker.restore_stack(
            mark_stack
                .iter()
                .map(|cell| cell.load(Ordering::Relaxed))
                .collect(),
        );
    }

    let mut outcome = EvacuationOutcome {
        surviving_words: vec![0; request.young_cset_regions],
        ..Default::default()
    };
    for result in results.into_inner() {
        outcome.merge(result);
    }
    outcome.evacuation_failed |= ctx.evacuation_failed.load(Ordering::Acquire);
    log::debug!(
        "evacuated {} objects ({} bytes) with {} workers: {} cards refined, {} rset cards, {} steals, {} overflowed",
        outcome.objects_copied,
        outcome.bytes_copied,
        n_workers,
        outcome.refine.cards_refined,
        outcome.rs_cards_scanned,
        outcome.steals,
        outcome.overflowed
    );
    if outcome.evacuation_failed {
        log::warn!(
            "evacuation failed: {} objects forwarded to themselves",
            outcome.self_forwarded
        );
    }
    outcome
}
