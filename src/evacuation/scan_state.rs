use std::sync::atomic::Ordering;
use std::time::Instant;

use crossbeam::deque::{Steal, Worker};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{EvacuationContext, EvacuationOutcome};
use crate::address::Address;
use crate::allocation::GcAllocPurpose;
use crate::globals::{CARD_SIZE, HEAP_WORD_SIZE, TASKQUEUE_SIZE};
use crate::header::{fill_range, load_slot, store_slot, walk_objects, ForwardingState, MarkWord, ObjectKind, ObjectRef};
use crate::refine::{for_each_slot_in, record_reference, refine_card};
use crate::region::Region;
use crate::region_directory::RSET_SCAN_CLAIM_VALUE;
use crate::roots::RootVisitor;
use crate::tlab::{should_refill, LocalAllocBuffer};

/// Mark stack entries a worker claims at a time.
const MARK_STACK_CHUNK: usize = 128;

/// A pending unit of evacuation work.
#[derive(Clone, Copy, Debug)]
pub enum ScanTask {
    /// A reference slot whose target may have to be copied.
    Slot(Address),
    /// The slots of `array` from `start` on. Large reference arrays are scanned in
    /// chunks so that other workers can steal the rest.
    PartialArray { array: ObjectRef, start: usize },
}

/// Per-worker evacuation state. Never shared; other workers only see the stealer
/// end of its queue.
pub(crate) struct ScanState<'a> {
    pub(super) ctx: &'a EvacuationContext<'a>,
    worker_id: usize,
    queue: Worker<ScanTask>,
    overflow: Vec<ScanTask>,
    plabs: [LocalAllocBuffer; 2],
    rng: StdRng,
    pub(super) failure_stack: Vec<ObjectRef>,
    pub(super) draining_failure_stack: bool,
    pub(super) stats: EvacuationOutcome,
}

impl<'a> ScanState<'a> {
    pub fn new(ctx: &'a EvacuationContext<'a>, worker_id: usize, queue: Worker<ScanTask>) -> Self {
        Self {
            ctx,
            worker_id,
            queue,
            overflow: Vec::new(),
            plabs: [LocalAllocBuffer::new(), LocalAllocBuffer::new()],
            rng: StdRng::seed_from_u64(0x9e37_79b9_7f4a_7c15 ^ worker_id as u64),
            failure_stack: Vec::new(),
            draining_failure_stack: false,
            stats: EvacuationOutcome {
                surviving_words: vec![0; ctx.young_cset_regions],
                ..Default::default()
            },
        }
    }

    pub fn run(&mut self, initial_slots: &[Address]) {
        self.update_rs();
        self.ctx.phase_barrier.wait();

        for slot in initial_slots.iter() {
            self.push_task(ScanTask::Slot(*slot));
        }
        self.scan_roots();
        self.scan_rem_sets();
        self.drain();
        loop {
            if let Some(task) = self.steal() {
                self.process(task);
                self.drain();
                continue;
            }
            if self.ctx.terminator.try_terminate() {
                break;
            }
        }
        crate::guarantee!(
            self.queue.is_empty() && self.overflow.is_empty(),
            "worker {} terminated with pending work",
            self.worker_id
        );
    }

    /// Retires the promotion buffers and hands back the statistics.
    pub fn finish(mut self) -> EvacuationOutcome {
        for plab in self.plabs.iter_mut() {
            plab.retire();
            self.stats.plab_waste_words += plab.words_wasted();
        }
        self.stats
    }

    /// Refines whatever the mutators logged since the last refinement, so that the
    /// remembered sets of the collection set are complete.
    fn update_rs(&mut self) {
        let heap = self.ctx.heap;
        let start = Instant::now();
        while let Some(buf) = heap.dirty_cards.take_completed_buffer() {
            for card in buf {
                refine_card(heap, card, true, &mut self.stats.refine);
            }
        }
        if self.worker_id == 0 {
            for card in heap.hot_cards.drain() {
                refine_card(heap, card, true, &mut self.stats.refine);
            }
        }
        self.stats.update_rs_time_ms = start.elapsed().as_secs_f64() * 1000.0;
    }

    #[inline]
    pub(super) fn in_cset(&self, obj: ObjectRef) -> bool {
        let regions = &self.ctx.heap.regions;
        regions.is_in_committed(obj.address()) && regions.addr_to_region(obj.address()).in_collection_set()
    }

    #[inline]
    fn evacuate_root(&mut self, raw: usize) -> usize {
        match ObjectRef::from_raw(raw) {
            Some(obj) if self.in_cset(obj) => self.copy_to_survivor_space(obj).raw(),
            _ => raw,
        }
    }

    fn scan_roots(&mut self) {
        let ctx = self.ctx;
        let heap = ctx.heap;
        if self.worker_id == 0 {
            heap.roots.for_each_slot(|slot| *slot = self.evacuate_root(*slot));
            let mut providers = heap.root_providers.lock();
            for provider in providers.iter_mut() {
                let mut f = |slot: &mut usize| *slot = self.evacuate_root(*slot);
                let mut visitor = RootVisitor::new(&mut f);
                provider(&mut visitor);
            }
        }

        loop {
            let i = ctx.next_thread_root.fetch_add(1, Ordering::AcqRel);
            if i >= ctx.thread_roots.len() {
                break;
            }
            ctx.thread_roots[i].for_each_slot(|slot| *slot = self.evacuate_root(*slot));
        }

        loop {
            let start = ctx.next_mark_chunk.fetch_add(MARK_STACK_CHUNK, Ordering::AcqRel);
            if start >= ctx.mark_stack.len() {
                break;
            }
            let end = (start + MARK_STACK_CHUNK).min(ctx.mark_stack.len());
            for cell in ctx.mark_stack[start..end].iter() {
                let raw = cell.load(Ordering::Relaxed);
                cell.store(self.evacuate_root(raw), Ordering::Relaxed);
            }
        }

        loop {
            let i = ctx.next_scan_only.fetch_add(1, Ordering::AcqRel);
            if i >= ctx.scan_only.len() {
                break;
            }
            let region = heap.regions.at(ctx.scan_only[i]);
            walk_objects(region.bottom(), region.top(), |obj| {
                for slot in obj.slots() {
                    if let Some(value) = load_slot(slot) {
                        if self.in_cset(value) {
                            self.push_task(ScanTask::Slot(slot));
                        }
                    }
                }
            });
        }
    }

    /// Scans the cards recorded in the remembered sets of the collection set.
    /// Regions are claimed as a whole; cards are claimed individually since several
    /// remembered sets may list the same card.
    fn scan_rem_sets(&mut self) {
        let ctx = self.ctx;
        let n = ctx.cset.len();
        if n == 0 {
            return;
        }
        let offset = self.worker_id * n / ctx.stealers.len().max(1);
        for i in 0..n {
            let region = ctx.heap.regions.at(ctx.cset[(offset + i) % n]);
            if !region.claim(RSET_SCAN_CLAIM_VALUE) {
                continue;
            }
            for card in region.rem_set().cards() {
                self.scan_card(card);
            }
        }
    }

    fn scan_card(&mut self, card: usize) {
        let heap = self.ctx.heap;
        let regions = &heap.regions;
        if !heap.card_table.claim(card) {
            return;
        }
        let start = regions.card_start(card);
        if !regions.is_in_committed(start) {
            return;
        }
        let source = regions.addr_to_region(start);
        if source.in_collection_set() || source.is_young() || source.is_free() {
            return;
        }
        let card_end = (start + CARD_SIZE).min(source.scan_top(self.ctx.stamp));
        if start >= card_end {
            return;
        }
        let bottom = match source.humongous_start() {
            Some(head) if source.is_continues_humongous() => regions.at(head).bottom(),
            _ => source.bottom(),
        };
        let mut obj = heap.bot.object_containing(bottom, start);
        while obj.address() < card_end {
            for_each_slot_in(obj, start, card_end, |slot| {
                if let Some(value) = load_slot(slot) {
                    if self.in_cset(value) {
                        self.push_task(ScanTask::Slot(slot));
                    }
                }
            });
            obj = unsafe { ObjectRef::from_address(obj.end()) };
        }
        self.stats.rs_cards_scanned += 1;
    }

    #[inline]
    pub(super) fn push_task(&mut self, task: ScanTask) {
        if self.queue.len() >= TASKQUEUE_SIZE {
            self.overflow.push(task);
            self.stats.overflowed += 1;
        } else {
            self.queue.push(task);
        }
    }

    fn drain(&mut self) {
        loop {
            let task = match self.overflow.pop() {
                Some(task) => task,
                None => match self.queue.pop() {
                    Some(task) => task,
                    None => return,
                },
            };
            self.process(task);
        }
    }

    fn steal(&mut self) -> Option<ScanTask> {
        let ctx = self.ctx;
        let stealers = &ctx.stealers;
        if stealers.len() <= 1 {
            return None;
        }
        let distribution = Uniform::new(0, stealers.len());
        for _ in 0..2 * stealers.len() {
            let victim = distribution.sample(&mut self.rng);
            if victim == self.worker_id {
                continue;
            }
            loop {
                match stealers[victim].steal() {
                    Steal::Success(task) => {
                        self.stats.steals += 1;
                        return Some(task);
                    }
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    }

    fn process(&mut self, task: ScanTask) {
        match task {
            ScanTask::Slot(slot) => self.scan_slot(slot),
            ScanTask::PartialArray { array, start } => self.scan_partial_array(array, start),
        }
    }

    fn scan_slot(&mut self, slot: Address) {
        let obj = match load_slot(slot) {
            Some(obj) => obj,
            None => return,
        };
        let value = if self.in_cset(obj) {
            let copy = self.copy_to_survivor_space(obj);
            if copy != obj {
                store_slot(slot, Some(copy));
            }
            copy
        } else {
            obj
        };
        self.par_write_ref(slot, value);
    }

    fn scan_partial_array(&mut self, array: ObjectRef, start: usize) {
        let len = array.ref_count();
        let chunk = self.ctx.array_chunk;
        let end = if len - start > 2 * chunk {
            self.push_task(ScanTask::PartialArray {
                array,
                start: start + chunk,
            });
            start + chunk
        } else {
            len
        };
        for i in start..end {
            self.scan_slot(array.slot(i));
        }
    }

    /// Records the reference just written to `slot` in the target's remembered set.
    ///
    /// Slots inside the collection set belong to objects that are either dead or
    /// forwarded to themselves; the latter are recorded once evacuation is over.
    #[inline]
    fn par_write_ref(&mut self, slot: Address, value: ObjectRef) {
        let regions = &self.ctx.heap.regions;
        if regions.addr_to_region(slot).in_collection_set() || !regions.is_in_committed(value.address()) {
            return;
        }
        let target = regions.addr_to_region(value.address());
        if target.in_collection_set() && !target.evacuation_failed() {
            return;
        }
        if record_reference(self.ctx.heap, slot, value) {
            self.stats.refine.refs_recorded += 1;
        }
    }

    /// Resolves a forwarding mark installed by someone else.
    #[inline]
    pub(super) fn resolve(&self, obj: ObjectRef, mark: MarkWord) -> ObjectRef {
        match mark.forwarding_state() {
            ForwardingState::ForwardedTo(word) => self.ctx.heap.object_at_word(word),
            ForwardingState::SelfForwarded | ForwardingState::NotForwarded => obj,
        }
    }

    /// Copies `obj` out of the collection set, or finds the copy another worker
    /// made. Returns where the object lives from now on.
    pub(crate) fn copy_to_survivor_space(&mut self, obj: ObjectRef) -> ObjectRef {
        let heap = self.ctx.heap;
        let mark = obj.mark();
        if mark.forwarding_state() != ForwardingState::NotForwarded {
            return self.resolve(obj, mark);
        }
        let from = heap.regions.addr_to_region(obj.address());
        let words = obj.size_words();
        let purpose = self.ctx.destination.destination(from.is_young(), mark.age());
        let (dest, actual, in_plab) = match self.allocate(purpose, words) {
            Some(allocation) => allocation,
            None => return self.handle_evacuation_failure(obj, from),
        };

        let prev = match obj.forward_atomic(MarkWord::forwarded_to(heap.word_index(dest))) {
            Ok(prev) => prev,
            Err(winner) => {
                self.undo_allocation(actual, dest, words, in_plab);
                return self.resolve(obj, winner);
            }
        };

        unsafe {
            std::ptr::copy_nonoverlapping(obj.address().to_ptr::<usize>(), dest.to_mut_ptr::<usize>(), words);
        }
        let copy = unsafe { ObjectRef::from_address(dest) };
        let new_mark = match actual {
            GcAllocPurpose::Survived => {
                let aged = prev.incr_age();
                self.stats.age_table.add(aged.age(), words);
                aged
            }
            GcAllocPurpose::Tenured => prev,
        };
        copy.set_mark(new_mark);

        let young_index = from.young_index_in_cset();
        if young_index >= 0 {
            self.stats.surviving_words[young_index as usize] += words;
        }
        self.stats.bytes_copied += words * HEAP_WORD_SIZE;
        self.stats.objects_copied += 1;
        if self.ctx.marking && heap.marker.is_live(from, obj) {
            heap.marker.bitmap().par_mark(dest);
        }

        if copy.kind() == ObjectKind::RefArray && copy.ref_count() > 2 * self.ctx.array_chunk {
            self.push_task(ScanTask::PartialArray { array: copy, start: 0 });
        } else {
            for slot in copy.slots() {
                self.push_task(ScanTask::Slot(slot));
            }
        }
        copy
    }

    /// Allocation for a copy: the promotion buffer of `purpose` first, then a new
    /// buffer if the object is small enough, then directly in a GC allocation region.
    fn allocate(&mut self, purpose: GcAllocPurpose, words: usize) -> Option<(Address, GcAllocPurpose, bool)> {
        let heap = self.ctx.heap;
        if let Some(addr) = self.plabs[purpose.index()].allocate(words) {
            return Some((addr, purpose, true));
        }
        let plab_words = self.ctx.plab_words;
        if should_refill(words, plab_words, self.ctx.waste_percent) {
            if let Some((buf, actual)) = heap.gc_alloc.par_allocate(&heap.regions, &heap.bot, purpose, plab_words) {
                let plab = &mut self.plabs[actual.index()];
                plab.retire();
                plab.set_buf(buf, plab_words);
                if let Some(addr) = plab.allocate(words) {
                    return Some((addr, actual, true));
                }
            }
        }
        heap.gc_alloc
            .par_allocate(&heap.regions, &heap.bot, purpose, words)
            .map(|(addr, actual)| (addr, actual, false))
    }

    fn undo_allocation(&mut self, purpose: GcAllocPurpose, addr: Address, words: usize, in_plab: bool) {
        let undone = if in_plab {
            self.plabs[purpose.index()].undo_allocation(addr, words)
        } else {
            self.ctx.heap.regions.addr_to_region(addr).par_undo_allocation(addr, words)
        };
        if !undone {
            fill_range(addr, addr.add_words(words));
        }
    }

    pub(super) fn failed_region(&self, from: &Region) {
        from.set_evacuation_failed(true);
        self.ctx.evacuation_failed.store(true, Ordering::Release);
    }
}
