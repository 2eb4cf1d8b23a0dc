//! Snapshot-at-the-beginning concurrent marking.
//!
//! A cycle starts at the end of a young pause (initial mark): every region's next
//! top at mark start (NTAMS) is set to its current top, the roots and all survivor
//! objects are marked, and the SATB pre-barrier is switched on. Objects allocated
//! after that are above NTAMS and implicitly live. The marker thread then traces
//! the object graph concurrently, processing the values the mutators overwrite as
//! additional grey objects, and finally requests a remark pause that finishes the
//! trace, computes per-region liveness and frees regions without any live data.
//!
//! Marking survives evacuation pauses: the global mark stack is treated as a root
//! set by evacuation and copies of live objects are marked in the bitmap.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::globals::HEAP_WORD_SIZE;
use crate::header::{load_slot, walk_objects, ObjectRef};
use crate::heap::{Heap, HeapState};
use crate::mark_bitmap::MarkBitmap;
use crate::region::{Region, RegionIndex};
use crate::region_directory::CLEANUP_CLAIM_VALUE;
use crate::statistics::GcEvent;

/// Objects traced between two looks at the SATB queue.
const SATB_POLL_INTERVAL: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkPhase {
    Idle,
    Marking,
    Remark,
}

pub struct ConcurrentMark {
    bitmap: MarkBitmap,
    /// Grey objects published by pauses and by the marker before it yields.
    stack: Mutex<Vec<usize>>,
    phase: Mutex<MarkPhase>,
    cv: Condvar,
    marking: AtomicBool,
    aborted: AtomicBool,
    cycles_started: AtomicUsize,
    cycles_completed: AtomicUsize,
}

impl ConcurrentMark {
    pub fn new(bitmap: MarkBitmap) -> Self {
        Self {
            bitmap,
            stack: Mutex::new(Vec::new()),
            phase: Mutex::new(MarkPhase::Idle),
            cv: Condvar::new(),
            marking: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            cycles_started: AtomicUsize::new(0),
            cycles_completed: AtomicUsize::new(0),
        }
    }

    pub fn bitmap(&self) -> &MarkBitmap {
        &self.bitmap
    }

    /// True between initial mark and remark.
    #[inline(always)]
    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> MarkPhase {
        *self.phase.lock()
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn cycles_started(&self) -> usize {
        self.cycles_started.load(Ordering::Acquire)
    }

    pub fn cycles_completed(&self) -> usize {
        self.cycles_completed.load(Ordering::Acquire)
    }

    /// Whether `obj` in `region` survived the current (or last) marking.
    #[inline]
    pub fn is_live(&self, region: &Region, obj: ObjectRef) -> bool {
        obj.address() >= region.ntams() || self.bitmap.is_marked(obj.address())
    }

    /// Marks `obj` if it lies below its region's NTAMS. Returns true if the object
    /// turned grey with this call.
    #[inline]
    pub fn mark_object(&self, heap: &Heap, obj: ObjectRef) -> bool {
        if !heap.regions.is_in_committed(obj.address()) {
            return false;
        }
        let region = heap.regions.addr_to_region(obj.address());
        if obj.address() >= region.ntams() {
            return false;
        }
        self.bitmap.par_mark(obj.address())
    }

    /// Marks `obj` and, if it turned grey, pushes it onto `stack`.
    #[inline]
    pub fn mark_and_push(&self, heap: &Heap, obj: ObjectRef, stack: &mut Vec<usize>) {
        if self.mark_object(heap, obj) {
            stack.push(obj.raw());
        }
    }

    /// Marks `obj` during a pause, publishing it on the global stack.
    pub fn mark_and_push_global(&self, heap: &Heap, obj: ObjectRef) {
        if self.mark_object(heap, obj) {
            self.stack.lock().push(obj.raw());
        }
    }

    /// Marks `obj` regardless of NTAMS. Used for objects that stay in place while
    /// their region's NTAMS is moved past them.
    pub(crate) fn mark_in_place_and_push(&self, obj: ObjectRef) {
        if self.bitmap.par_mark(obj.address()) {
            self.stack.lock().push(obj.raw());
        }
    }

    pub fn stack_len(&self) -> usize {
        self.stack.lock().len()
    }

    /// Hands the global stack to evacuation, which updates the entries in place.
    pub(crate) fn take_stack(&self) -> Vec<usize> {
        std::mem::take(&mut *self.stack.lock())
    }

    pub(crate) fn restore_stack(&self, entries: Vec<usize>) {
        let mut stack = self.stack.lock();
        stack.extend(entries.into_iter().filter(|raw| *raw != 0));
    }

    fn flush_local(&self, local: &mut Vec<usize>) {
        if !local.is_empty() {
            self.stack.lock().append(local);
        }
    }

    fn refill(&self, local: &mut Vec<usize>) -> bool {
        let mut stack = self.stack.lock();
        let take = stack.len().min(256);
        let at = stack.len() - take;
        local.extend(stack.drain(at..));
        take > 0
    }

    fn scan_object(&self, heap: &Heap, obj: ObjectRef, local: &mut Vec<usize>) {
        for slot in obj.slots() {
            if let Some(value) = load_slot(slot) {
                self.mark_and_push(heap, value, local);
            }
        }
    }

    /// Marks the values of every completed SATB buffer. Returns how many buffers
    /// were processed.
    fn drain_satb_buffers(&self, heap: &Heap, local: &mut Vec<usize>) -> usize {
        let mut n = 0;
        while let Some(buf) = heap.satb.take_completed_buffer() {
            for raw in buf {
                if let Some(obj) = ObjectRef::from_raw(raw) {
                    self.mark_and_push(heap, obj, local);
                }
            }
            n += 1;
        }
        n
    }

    /// Pause-side SATB drain: marks the logged values without tracing from them.
    pub(crate) fn drain_satb_at_pause(&self, heap: &Heap) {
        let mut local = Vec::new();
        self.drain_satb_buffers(heap, &mut local);
        self.flush_local(&mut local);
    }

    /// Starts a cycle. Runs inside the pause that decided to start it.
    pub(crate) fn checkpoint_roots_initial(&self, heap: &Heap, state: &HeapState) {
        crate::guarantee!(!self.is_marking(), "initial mark while a cycle is running");
        self.bitmap.clear_all();
        self.stack.lock().clear();
        for region in heap.regions.iter() {
            region.set_marked_bytes(0);
            if region.is_free() {
                region.set_ntams(region.bottom());
            } else {
                region.set_ntams(region.top());
            }
        }

        let mut local = Vec::new();
        heap.visit_roots(&mut |slot: &mut usize| {
            if let Some(obj) = ObjectRef::from_raw(*slot) {
                self.mark_and_push(heap, obj, &mut local);
            }
        });
        // Survivors are not covered by the snapshot's remembered sets; treat them as roots.
        for region in state.young_list.iter(heap.regions.all()) {
            walk_objects(region.bottom(), region.top(), |obj| {
                if !obj.is_filler() {
                    self.mark_and_push(heap, obj, &mut local);
                }
            });
        }
        let grey = local.len();
        self.flush_local(&mut local);

        heap.satb.abandon_completed_buffers();
        heap.satb.set_active(true);
        self.aborted.store(false, Ordering::Release);
        self.marking.store(true, Ordering::Release);
        self.cycles_started.fetch_add(1, Ordering::AcqRel);
        *self.phase.lock() = MarkPhase::Marking;
        self.cv.notify_all();
        log::debug!("initial mark: {} grey objects", grey);
        heap.fire_event(&GcEvent::ConcurrentCycleStart {
            cycle: self.cycles_started(),
        });
    }

    /// Blocks the marker thread until a cycle is running. Returns false on shutdown.
    fn wait_for_cycle(&self, heap: &Heap) -> bool {
        let mut phase = self.phase.lock();
        while *phase != MarkPhase::Marking && !heap.is_shutting_down() {
            self.cv.wait_for(&mut phase, Duration::from_millis(50));
        }
        !heap.is_shutting_down()
    }

    /// Concurrent trace. Returns true once the graph reachable from the grey set
    /// has been traced, false if the cycle was aborted or the heap shuts down.
    fn mark_from_roots(&self, heap: &Heap, local: &mut Vec<usize>) -> bool {
        let mut since_satb = 0;
        loop {
            if heap.safepoint.is_armed() {
                // Evacuation moves objects; only the global stack gets updated.
                self.flush_local(local);
                heap.safepoint.park();
            }
            if self.was_aborted() || !self.is_marking() || heap.is_shutting_down() {
                local.clear();
                return false;
            }
            since_satb += 1;
            if since_satb >= SATB_POLL_INTERVAL || local.is_empty() {
                since_satb = 0;
                self.drain_satb_buffers(heap, local);
            }
            match local.pop().and_then(ObjectRef::from_raw) {
                Some(obj) => self.scan_object(heap, obj, local),
                None => {
                    if !self.refill(local) {
                        return true;
                    }
                }
            }
        }
    }

    fn trace_to_completion(&self, heap: &Heap) -> usize {
        let mut local = Vec::new();
        let mut scanned = 0;
        loop {
            self.drain_satb_buffers(heap, &mut local);
            match local.pop().and_then(ObjectRef::from_raw) {
                Some(obj) => {
                    self.scan_object(heap, obj, &mut local);
                    scanned += 1;
                }
                None => {
                    if !self.refill(&mut local) && heap.satb.completed_buffers() == 0 {
                        return scanned;
                    }
                }
            }
        }
    }

    /// Recomputes the marked bytes of every old region on the GC workers. Returns
    /// the regions without live data (whole runs for dead humongous objects) and
    /// the old regions with garbage, both in index order.
    fn count_live_bytes(&self, heap: &Heap) -> (Vec<RegionIndex>, Vec<RegionIndex>) {
        let regions = &heap.regions;
        regions.reset_claim_values();
        let freed = Mutex::new(Vec::new());
        let candidates = Mutex::new(Vec::new());
        let mut pool = heap.workers.lock();
        let n_workers = pool.thread_count().max(1) as usize;
        pool.scoped(|scope| {
            for worker_id in 0..n_workers {
                let freed = &freed;
                let candidates = &candidates;
                scope.execute(move || {
                    let mut local_freed = Vec::new();
                    let mut local_candidates = Vec::new();
                    regions.iterate_parallel(worker_id, n_workers, CLEANUP_CLAIM_VALUE, |region| {
                        if region.is_old() && !region.popular() {
                            let mut marked = 0;
                            self.bitmap
                                .visit_marked_range(region.bottom(), region.ntams(), |addr| {
                                    let obj = unsafe { ObjectRef::from_address(addr) };
                                    marked += obj.size_words() * HEAP_WORD_SIZE;
                                });
                            region.set_marked_bytes(marked);
                            if region.used() > 0 && region.live_bytes() == 0 {
                                local_freed.push(region.index());
                            } else if region.garbage_bytes() > 0 {
                                local_candidates.push(region.index());
                            }
                        } else if region.is_continues_humongous() {
                            // Decided together with the head, which is visited right after.
                            let head = region.humongous_start();
                            if head.map_or(false, |head| self.humongous_is_dead(regions.at(head))) {
                                local_freed.push(region.index());
                            }
                        } else if region.is_starts_humongous() && self.humongous_is_dead(region) {
                            local_freed.push(region.index());
                        }
                    });
                    freed.lock().extend(local_freed);
                    candidates.lock().extend(local_candidates);
                });
            }
        });
        drop(pool);
        crate::guarantee!(
            regions.check_claim_values(CLEANUP_CLAIM_VALUE),
            "cleanup left regions unclaimed"
        );
        let mut freed = freed.into_inner();
        let mut candidates = candidates.into_inner();
        freed.sort_unstable();
        candidates.sort_unstable();
        (freed, candidates)
    }

    fn humongous_is_dead(&self, head: &Region) -> bool {
        head.ntams() > head.bottom() && !self.bitmap.is_marked(head.bottom())
    }

    /// Remark and cleanup. Runs at a safepoint requested by the marker thread.
    ///
    /// Returns the regions found dead; they are kind `Free` but on no list until
    /// [`ConcurrentMark::complete_cleanup`] hands them back.
    pub(crate) fn remark_and_cleanup(&self, heap: &Heap, state: &mut HeapState) -> Option<Vec<RegionIndex>> {
        if !self.is_marking() {
            return None;
        }
        *self.phase.lock() = MarkPhase::Remark;
        let scanned = self.trace_to_completion(heap);
        heap.satb.set_active(false);
        heap.satb.abandon_completed_buffers();
        self.marking.store(false, Ordering::Release);

        let regions = &heap.regions;
        let (freed, candidates) = self.count_live_bytes(heap);
        for index in freed.iter() {
            let region = regions.at(*index);
            self.bitmap.clear_range(region.bottom(), region.end());
            heap.card_table.clear_range(region.bottom(), region.end());
            region.hr_clear(true);
        }

        state
            .policy
            .record_concurrent_mark_cleanup_end(regions.all(), candidates);
        heap.recompute_used();
        if !freed.is_empty() {
            heap.barrier.begin_cleanup();
        }
        self.cycles_completed.fetch_add(1, Ordering::AcqRel);
        *self.phase.lock() = MarkPhase::Idle;
        self.cv.notify_all();
        log::debug!(
            "remark: traced {} more objects, {} regions dead, {} mixed candidates",
            scanned,
            freed.len(),
            state.policy.mixed_candidates()
        );
        Some(freed)
    }

    /// Returns the regions freed by cleanup to the unclean list and lets pauses run again.
    pub(crate) fn complete_cleanup(&self, heap: &Heap, freed: &[RegionIndex]) {
        if freed.is_empty() {
            return;
        }
        heap.regions.free_regions(freed);
        heap.barrier.complete_cleanup();
    }

    /// Discards the running cycle. Only at a safepoint.
    pub(crate) fn abort(&self, heap: &Heap, state: &mut HeapState) {
        if !self.is_marking() && self.phase() == MarkPhase::Idle {
            return;
        }
        self.marking.store(false, Ordering::Release);
        heap.satb.set_active(false);
        heap.satb.abandon_completed_buffers();
        self.stack.lock().clear();
        self.bitmap.clear_all();
        self.aborted.store(true, Ordering::Release);
        state.policy.record_concurrent_mark_abort();
        *self.phase.lock() = MarkPhase::Idle;
        self.cv.notify_all();
        log::debug!("concurrent mark aborted");
    }

    /// Blocks until at least `n` cycles completed. Returns false if the wait timed out
    /// or no cycle is running or pending anymore.
    pub fn wait_for_cycles_completed(&self, n: usize, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut phase = self.phase.lock();
        while self.cycles_completed() < n {
            if self.cv.wait_until(&mut phase, deadline).timed_out() {
                return self.cycles_completed() >= n;
            }
        }
        true
    }

    pub(crate) fn notify(&self) {
        let guard = self.phase.lock();
        self.cv.notify_all();
        drop(guard);
    }
}

/// Body of the concurrent marking thread.
pub(crate) fn marker_thread(heap: Arc<Heap>) {
    heap.safepoint.register();
    log::debug!("concurrent mark thread started");
    let mut local = Vec::new();
    loop {
        {
            let _safe = heap.safepoint.enter_safe_region();
            if !heap.marker.wait_for_cycle(&heap) {
                break;
            }
        }
        if !heap.marker.mark_from_roots(&heap, &mut local) {
            continue;
        }
        let marker = &heap.marker;
        let freed = heap.run_at_safepoint(true, |state| marker.remark_and_cleanup(&heap, state));
        if let Some(freed) = freed {
            marker.complete_cleanup(&heap, &freed);
            heap.fire_event(&GcEvent::ConcurrentCycleEnd {
                cycle: marker.cycles_completed(),
                freed_regions: freed.len(),
            });
        }
    }
    log::debug!("concurrent mark thread stopped");
    heap.safepoint.unregister();
}
