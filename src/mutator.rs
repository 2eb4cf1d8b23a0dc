use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::address::Address;
use crate::error::{GcError, GcResult};
use crate::globals::{QUEUED_ALLOCATION_WARNING_COUNT, HEAP_WORD_SIZE};
use crate::header::{initialize_object, load_slot, store_slot, walk_objects, ObjectRef, Shape};
use crate::heap::{AllocOutcome, AllocRequest, Heap};
use crate::ptr_queue::PtrQueue;
use crate::roots::{Root, RootSet};
use crate::statistics::{FullGcSummary, GcCause, PauseSummary};
use crate::tlab::{should_refill, LocalAllocBuffer};
use crate::verify::RegionCensus;

/// Objects smaller than this share of a TLAB retire the TLAB when they do not fit;
/// larger ones are allocated directly in the mutator region.
const TLAB_REFILL_WASTE_PERCENT: usize = 50;

/// A thread attached to the heap.
///
/// Owns the thread's TLAB, its dirty card and SATB queues and its root set. The
/// [`ObjectRef`]s a mutator hands out stay valid only until the next call that may
/// reach a safepoint ([`allocate`](Self::allocate), [`poll`](Self::poll),
/// [`safe_region`](Self::safe_region), the `collect` family); anything that must
/// survive a collection has to be held in a [`Root`].
pub struct Mutator {
    heap: Arc<Heap>,
    tlab: LocalAllocBuffer,
    dirty_cards: PtrQueue,
    satb: PtrQueue,
    roots: Arc<RootSet>,
}

impl Mutator {
    /// Registers a new participant. The calling thread must not be a running
    /// mutator itself; use [`spawn_mutator`](Self::spawn_mutator) from one.
    pub(crate) fn new(heap: Arc<Heap>) -> Mutator {
        heap.safepoint.register();
        let roots = Arc::new(RootSet::new());
        heap.thread_roots.lock().push(roots.clone());
        Mutator {
            heap,
            tlab: LocalAllocBuffer::new(),
            dirty_cards: PtrQueue::new(),
            satb: PtrQueue::new(),
            roots,
        }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Spawns a thread with its own mutator attached to the same heap.
    pub fn spawn_mutator<F, R>(&mut self, closure: F) -> JoinHandle<R>
    where
        F: FnOnce(&mut Mutator) -> R + Send + 'static,
        R: Send + 'static,
    {
        let heap = self.heap.clone();
        let mut mutator = self.safe_region(|| Mutator::new(heap));
        std::thread::spawn(move || closure(&mut mutator))
    }

    /// Polls for a pending pause and parks until it is over. Returns true if it parked.
    #[inline(always)]
    pub fn poll(&mut self) -> bool {
        if self.heap.safepoint.is_armed() {
            self.poll_slow();
            return true;
        }
        false
    }

    #[inline(never)]
    #[cold]
    fn poll_slow(&mut self) {
        self.prepare_for_safepoint();
        self.heap.safepoint.park();
    }

    /// Retires the TLAB and hands the partially filled barrier buffers to the
    /// collector. Runs before this thread stops for a pause in any way.
    fn prepare_for_safepoint(&mut self) {
        self.tlab.retire();
        self.dirty_cards.flush(&self.heap.dirty_cards);
        self.satb.flush(&self.heap.satb);
    }

    /// Runs `f` while pauses may proceed without this thread. `f` must not touch
    /// the heap.
    pub fn safe_region<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.prepare_for_safepoint();
        let _safe = self.heap.safepoint.enter_safe_region();
        f()
    }

    /// Allocates an object of `shape`. Its reference slots are null.
    #[inline]
    pub fn allocate(&mut self, shape: Shape) -> GcResult<ObjectRef> {
        self.poll();
        if let Some(addr) = self.tlab.allocate(shape.size_words()) {
            return Ok(initialize_object(addr, shape));
        }
        self.allocate_slow(shape)
    }

    #[cold]
    fn allocate_slow(&mut self, shape: Shape) -> GcResult<ObjectRef> {
        let words = shape.size_words();
        if words >= self.heap.regions.sizes().humongous_threshold_words {
            // The header is written by the humongous allocator.
            let addr = self.allocate_with_collection(AllocRequest::Humongous(shape))?;
            return Ok(unsafe { ObjectRef::from_address(addr) });
        }

        let tlab_words = self.heap.tlab_words;
        if self.heap.config.use_tlab && should_refill(words, tlab_words, TLAB_REFILL_WASTE_PERCENT) {
            let buf = match self
                .heap
                .mutator_alloc
                .attempt_allocation(&self.heap.regions, tlab_words)
            {
                Some(buf) => buf,
                None => self.allocate_with_collection(AllocRequest::Words(tlab_words))?,
            };
            self.tlab.retire();
            self.tlab.set_buf(buf, tlab_words);
            if let Some(addr) = self.tlab.allocate(words) {
                return Ok(initialize_object(addr, shape));
            }
        }

        let addr = match self
            .heap
            .mutator_alloc
            .attempt_allocation(&self.heap.regions, words)
        {
            Some(addr) => addr,
            None => self.allocate_with_collection(AllocRequest::Words(words))?,
        };
        Ok(initialize_object(addr, shape))
    }

    /// Takes the heap lock to install a new mutator region, and stops the world
    /// when the young generation is full or no region is left.
    fn allocate_with_collection(&mut self, request: AllocRequest) -> GcResult<Address> {
        let heap = self.heap.clone();
        let mut attempts = 0usize;
        loop {
            let gc_count_before = heap.total_collections();
            if let Some(addr) = heap.attempt_allocation_locked(request) {
                return Ok(addr);
            }
            self.prepare_for_safepoint();
            {
                let _safe = heap.safepoint.enter_safe_region();
                heap.barrier.wait_for_cleanup_complete();
            }
            let outcome = heap.run_at_safepoint(true, |state| {
                heap.satisfy_failed_allocation(state, gc_count_before, request)
            });
            match outcome {
                AllocOutcome::Allocated(addr) => return Ok(addr),
                AllocOutcome::OutOfMemory => {
                    return Err(GcError::OutOfMemory {
                        requested: request.words() * HEAP_WORD_SIZE,
                    })
                }
                AllocOutcome::Retry => {}
            }
            attempts += 1;
            if attempts % QUEUED_ALLOCATION_WARNING_COUNT == 0 {
                log::warn!(
                    "allocation of {} words retried {} times",
                    request.words(),
                    attempts
                );
            }
        }
    }

    #[inline]
    pub fn read_ref(&self, obj: ObjectRef, index: usize) -> Option<ObjectRef> {
        load_slot(obj.slot(index))
    }

    /// Stores `value` into reference slot `index` of `obj`, with both barriers.
    #[inline]
    pub fn write_ref(&mut self, obj: ObjectRef, index: usize, value: Option<ObjectRef>) {
        let slot = obj.slot(index);
        let heap = &*self.heap;
        if heap.satb.is_active() {
            if let Some(old) = load_slot(slot) {
                self.satb.enqueue(old.raw(), &heap.satb);
            }
        }
        store_slot(slot, value);
        if let Some(value) = value {
            let shift = heap.regions.sizes().region_size_bytes_shift;
            if (slot.as_usize() ^ value.raw()) >> shift != 0 {
                // The store must be visible before a refiner can see the dirty card.
                fence(Ordering::SeqCst);
                let card = heap.regions.card_index(slot);
                if heap.card_table.mark_dirty(card) {
                    self.dirty_cards.enqueue(card, &heap.dirty_cards);
                }
            }
        }
    }

    #[inline]
    pub fn read_data(&self, obj: ObjectRef, index: usize) -> u64 {
        obj.read_data(index)
    }

    #[inline]
    pub fn write_data(&mut self, obj: ObjectRef, index: usize, value: u64) {
        obj.write_data(index, value);
    }

    pub fn root(&self, obj: Option<ObjectRef>) -> Root {
        self.roots.add(obj)
    }

    pub fn get(&self, root: &Root) -> Option<ObjectRef> {
        self.roots.get(root)
    }

    pub fn set_root(&self, root: &Root, obj: Option<ObjectRef>) {
        self.roots.set(root, obj);
    }

    pub fn release(&self, root: Root) {
        self.roots.remove(root);
    }

    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    /// Collects with `cause`: a full collection for explicit and last-ditch
    /// requests, an incremental pause otherwise.
    pub fn collect(&mut self, cause: GcCause) {
        match cause {
            GcCause::Explicit | GcCause::LastDitch => {
                self.collect_full_with_cause(cause);
            }
            _ => {
                self.collect_young_with_cause(cause);
            }
        }
    }

    pub fn collect_young(&mut self) -> PauseSummary {
        self.collect_young_with_cause(GcCause::YoungPause)
    }

    pub fn collect_full(&mut self) -> FullGcSummary {
        self.collect_full_with_cause(GcCause::Explicit)
    }

    fn collect_young_with_cause(&mut self, cause: GcCause) -> PauseSummary {
        self.wait_for_cleanup();
        let heap = self.heap.clone();
        heap.run_at_safepoint(true, |state| crate::pause::do_collection_pause(&heap, state, cause))
    }

    fn collect_full_with_cause(&mut self, cause: GcCause) -> FullGcSummary {
        self.wait_for_cleanup();
        let heap = self.heap.clone();
        heap.run_at_safepoint(true, |state| crate::full_gc::do_full_collection(&heap, state, cause))
    }

    fn wait_for_cleanup(&mut self) {
        let heap = self.heap.clone();
        self.safe_region(|| heap.barrier.wait_for_cleanup_complete());
    }

    /// Asks for a marking cycle and runs the young pause that starts it.
    /// Returns false if a cycle is already running.
    pub fn request_concurrent_mark(&mut self) -> GcResult<bool> {
        if !self.heap.config.conc_mark {
            return Err(GcError::Unsupported("concurrent marking is disabled"));
        }
        self.heap.state.lock().policy.request_conc_mark();
        Ok(self.collect_young().initiated_conc_mark)
    }

    /// Waits until every marking cycle started so far has completed.
    pub fn wait_for_marking_cycle(&mut self, timeout: Duration) -> bool {
        let heap = self.heap.clone();
        let target = heap.marker.cycles_started();
        self.safe_region(|| heap.marker.wait_for_cycles_completed(target, timeout))
    }

    /// Visits every object in the heap with the world stopped. `f` must not allocate.
    pub fn object_iterate(&mut self, mut f: impl FnMut(ObjectRef)) {
        self.prepare_for_safepoint();
        let heap = self.heap.clone();
        heap.run_at_safepoint(true, |_state| {
            for region in heap.regions.iter() {
                if region.is_free() || region.is_continues_humongous() {
                    continue;
                }
                walk_objects(region.bottom(), region.top(), |obj| {
                    if !obj.is_filler() {
                        f(obj);
                    }
                });
            }
        });
    }

    /// Verifies the heap with the world stopped.
    pub fn verify(&mut self) -> RegionCensus {
        self.prepare_for_safepoint();
        let heap = self.heap.clone();
        heap.run_at_safepoint(true, |state| heap.verify_at_safepoint(state, "on request"))
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.prepare_for_safepoint();
        let roots = self.roots.clone();
        self.heap
            .thread_roots
            .lock()
            .retain(|other| !Arc::ptr_eq(other, &roots));
        self.heap.safepoint.unregister();
    }
}

#[cold]
pub fn oom_abort() -> ! {
    log::error!("out of memory");
    std::process::abort();
}
