//! The collected heap.
//!
//! [`Heap`] owns every piece of collector state: the region directory and its side
//! tables, the young list and policy behind the heap lock, the allocation regions,
//! the queues the barriers feed and the background threads. Mutator threads reach
//! it through a [`Mutator`](crate::mutator::Mutator) handle.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};
use scoped_threadpool::Pool;

use crate::address::Address;
use crate::allocation::{humongous_obj_allocate, GcAllocRegions, MutatorAllocRegion};
use crate::block_offset_table::BlockOffsetTable;
use crate::card_table::CardTable;
use crate::collection_barrier::CollectionBarrier;
use crate::collection_set::CollectionSet;
use crate::concurrent_mark::{marker_thread, ConcurrentMark};
use crate::config::Config;
use crate::error::{GcError, GcResult};
use crate::globals::{bytes_to_words, formatted_size, CARD_SHIFT, HEAP_WORD_SIZE, MIN_OBJ_ALIGNMENT_WORDS};
use crate::header::{fill_range, ObjectRef, Shape};
use crate::mark_bitmap::MarkBitmap;
use crate::mutator::{oom_abort, Mutator};
use crate::policy::Policy;
use crate::popular::PopularRegions;
use crate::ptr_queue::PtrQueueSet;
use crate::refine::{refinement_thread, HotCardCache};
use crate::region::{RegionKind, RegionSizes};
use crate::region_directory::RegionDirectory;
use crate::remset::RemSetGeometry;
use crate::roots::{Root, RootProvider, RootSet, RootVisitor};
use crate::safepoint::Safepoint;
use crate::statistics::{GcCause, GcEvent, GcListener, GcStatistics};
use crate::verify::{verify_heap, RegionCensus};
use crate::young_list::YoungList;
use crate::zero_fill::zero_fill_thread;

/// State guarded by the heap lock.
///
/// Mutators take the lock on the allocation slow path; pauses hold it for their
/// whole duration.
pub struct HeapState {
    pub(crate) policy: Policy,
    pub(crate) young_list: YoungList,
    pub(crate) cset: CollectionSet,
}

/// A request that could not be served from a TLAB or the current mutator region.
#[derive(Clone, Copy, Debug)]
pub(crate) enum AllocRequest {
    Words(usize),
    Humongous(Shape),
}

impl AllocRequest {
    pub fn words(&self) -> usize {
        match self {
            AllocRequest::Words(words) => *words,
            AllocRequest::Humongous(shape) => shape.size_words(),
        }
    }

    pub fn is_humongous(&self) -> bool {
        matches!(self, AllocRequest::Humongous(_))
    }

    fn regions_needed(&self, region_words: usize) -> usize {
        match self {
            AllocRequest::Words(_) => 1,
            AllocRequest::Humongous(shape) => (shape.size_words() + region_words - 1) / region_words,
        }
    }
}

/// Result of the allocation slow path run at a safepoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AllocOutcome {
    Allocated(Address),
    /// Somebody else collected in between; try the normal path again.
    Retry,
    OutOfMemory,
}

pub struct Heap {
    pub(crate) config: Config,
    pub(crate) regions: RegionDirectory,
    pub(crate) card_table: CardTable,
    pub(crate) bot: BlockOffsetTable,
    pub(crate) state: Mutex<HeapState>,
    pub(crate) mutator_alloc: MutatorAllocRegion,
    pub(crate) gc_alloc: GcAllocRegions,
    pub(crate) safepoint: Safepoint,
    pub(crate) barrier: CollectionBarrier,
    pub(crate) dirty_cards: PtrQueueSet,
    pub(crate) hot_cards: HotCardCache,
    pub(crate) satb: PtrQueueSet,
    pub(crate) marker: ConcurrentMark,
    pub(crate) roots: RootSet,
    pub(crate) thread_roots: Mutex<Vec<Arc<RootSet>>>,
    pub(crate) root_providers: Mutex<Vec<RootProvider>>,
    pub(crate) popular: PopularRegions,
    pub(crate) workers: Mutex<Pool>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) tlab_words: usize,

    stats: Mutex<GcStatistics>,
    listeners: RwLock<Vec<GcListener>>,
    /// Used bytes of all non-free regions except the current mutator region.
    summary_used: AtomicUsize,
    total_collections: AtomicUsize,
    full_collections: AtomicUsize,
    gc_time_stamp: AtomicU32,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Side tables are sized for the reserved heap; failing to map them is fatal.
fn map_side_table<T>(name: &str, table: std::io::Result<T>) -> T {
    match table {
        Ok(table) => table,
        Err(err) => {
            log::error!("cannot map {}: {}", name, err);
            oom_abort()
        }
    }
}

impl Heap {
    pub fn new(config: Config) -> GcResult<Arc<Heap>> {
        config.validate()?;
        let sizes = RegionSizes::setup(config.max_heap_size, config.region_size)?;
        let geometry = RemSetGeometry {
            cards_per_region: sizes.region_size_bytes >> CARD_SHIFT,
            sparse_entries: config.rs_sparse_entries,
            fine_entries: 1 << config.log_rs_region_entries,
        };
        let regions = RegionDirectory::new(sizes, geometry, config.conc_zf_max_regions)?;
        let initial_regions = ((config.initial_heap_size + sizes.region_size_bytes - 1)
            / sizes.region_size_bytes)
            .max(config.num_popular_regions + 1);
        regions.expand_by(initial_regions)?;

        for i in 0..config.num_popular_regions {
            let index = regions.alloc_free_region_from_lists(true);
            crate::guarantee!(
                index.map(|index| index.as_usize()) == Some(i),
                "popular region {} is not at the bottom of the heap",
                i
            );
            if let Some(index) = index {
                let region = regions.at(index);
                region.set_kind(RegionKind::Old);
                region.set_popular(true);
            }
        }

        let base = regions.base();
        let card_table = map_side_table("card table", CardTable::new(base, sizes.max_heap_size));
        let bot = map_side_table("block offset table", BlockOffsetTable::new(base, sizes.max_heap_size));
        let bitmap = map_side_table("mark bitmap", MarkBitmap::new(base, sizes.max_heap_size));
        let hot_cards = map_side_table(
            "hot card cache",
            HotCardCache::new(
                card_table.num_cards(),
                config.conc_rs_log_cache_size,
                config.conc_rs_hot_card_limit,
            ),
        );

        let tlab_words = config
            .tlab_size
            .map(bytes_to_words)
            .unwrap_or(sizes.max_tlab_size_words)
            .min(sizes.max_tlab_size_words)
            .max(MIN_OBJ_ALIGNMENT_WORDS)
            / MIN_OBJ_ALIGNMENT_WORDS
            * MIN_OBJ_ALIGNMENT_WORDS;

        let mut policy = Policy::new(&config, sizes);
        policy.calculate_young_list_target_length(regions.len(), regions.free_regions_count(), 0);
        logln_if!(
            config.verbose,
            "heap: {} committed of {}, {} regions of {}, young target {}",
            formatted_size(regions.committed_bytes()),
            formatted_size(sizes.max_heap_size),
            regions.len(),
            formatted_size(sizes.region_size_bytes),
            policy.young_list_target_length()
        );

        let heap = Arc::new(Heap {
            dirty_cards: PtrQueueSet::new(
                "dirty cards",
                config.update_buffer_size,
                config.dirty_card_queue_max,
                true,
            ),
            satb: PtrQueueSet::new(
                "satb",
                config.satb_buffer_size,
                config.satb_process_completed_threshold,
                false,
            ),
            popular: PopularRegions::new(
                config.num_popular_regions,
                config.rs_pop_limit,
                config.obj_pop_limit,
            ),
            workers: Mutex::new(Pool::new(config.parallel_gc_threads.max(1) as u32)),
            state: Mutex::new(HeapState {
                policy,
                young_list: YoungList::new(),
                cset: CollectionSet::new(),
            }),
            summary_used: AtomicUsize::new(0),
            regions,
            card_table,
            bot,
            mutator_alloc: MutatorAllocRegion::new(),
            gc_alloc: GcAllocRegions::new(),
            safepoint: Safepoint::new(),
            barrier: CollectionBarrier::new(),
            hot_cards,
            marker: ConcurrentMark::new(bitmap),
            roots: RootSet::new(),
            thread_roots: Mutex::new(Vec::new()),
            root_providers: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            tlab_words,
            stats: Mutex::new(GcStatistics::default()),
            listeners: RwLock::new(Vec::new()),
            total_collections: AtomicUsize::new(0),
            full_collections: AtomicUsize::new(0),
            gc_time_stamp: AtomicU32::new(0),
            threads: Mutex::new(Vec::new()),
            config,
        });

        if heap.config.conc_refine {
            heap.spawn_background_thread("g1-refine", refinement_thread)?;
        }
        if heap.config.conc_mark {
            heap.spawn_background_thread("g1-marker", marker_thread)?;
        }
        if heap.config.conc_zero_fill {
            heap.spawn_background_thread("g1-zero-fill", zero_fill_thread)?;
        }
        Ok(heap)
    }

    fn spawn_background_thread(self: &Arc<Self>, name: &'static str, body: fn(Arc<Heap>)) -> GcResult<()> {
        let heap = self.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(heap))
            .map_err(|source| GcError::ThreadStart { name, source })?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Registers the calling thread as a mutator.
    pub fn attach_current_thread(self: &Arc<Self>) -> Mutator {
        Mutator::new(self.clone())
    }

    /// Stops the background threads and waits for them.
    ///
    /// A thread that owns a live [`Mutator`] must call this through
    /// [`Mutator::safe_region`], or the threads may wait for it forever.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.regions.request_zero_fill_shutdown();
        self.barrier.notify_shutdown_requested();
        self.marker.notify();
        self.dirty_cards.notify();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let name = handle.thread().name().unwrap_or("gc").to_string();
            if handle.join().is_err() {
                log::error!("{} thread panicked", name);
            }
        }
        log::debug!("heap shut down");
    }

    #[inline(always)]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn regions(&self) -> &RegionDirectory {
        &self.regions
    }

    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    /// Roots shared by all threads.
    pub fn global_roots(&self) -> &RootSet {
        &self.roots
    }

    pub fn add_global_root(&self, obj: Option<ObjectRef>) -> Root {
        self.roots.add(obj)
    }

    pub fn add_root_provider(&self, provider: RootProvider) {
        self.root_providers.lock().push(provider);
    }

    pub fn add_listener(&self, listener: GcListener) {
        self.listeners.write().push(listener);
    }

    pub fn statistics(&self) -> GcStatistics {
        self.stats.lock().clone()
    }

    pub fn total_collections(&self) -> usize {
        self.total_collections.load(Ordering::Acquire)
    }

    pub fn full_collections(&self) -> usize {
        self.full_collections.load(Ordering::Acquire)
    }

    pub fn concurrent_cycles_completed(&self) -> usize {
        self.marker.cycles_completed()
    }

    pub fn is_marking(&self) -> bool {
        self.marker.is_marking()
    }

    /// Remembered set size past which a region is queued as popular.
    pub fn rs_pop_limit(&self) -> usize {
        self.popular.rs_pop_limit()
    }

    pub fn young_list_length(&self) -> usize {
        self.state.lock().young_list.length()
    }

    pub fn young_list_target_length(&self) -> usize {
        self.state.lock().policy.young_list_target_length()
    }

    pub fn region_size(&self) -> usize {
        self.regions.sizes().region_size_bytes
    }

    pub fn capacity(&self) -> usize {
        self.regions.committed_bytes()
    }

    pub fn max_capacity(&self) -> usize {
        self.regions.sizes().max_heap_size
    }

    pub fn free_regions(&self) -> usize {
        self.regions.free_regions_count()
    }

    /// Bytes in use, including the part of the current mutator region handed out so far.
    pub fn used(&self) -> usize {
        let current = self
            .mutator_alloc
            .current()
            .map_or(0, |index| self.regions.at(index).used());
        self.summary_used.load(Ordering::Acquire) + current
    }

    pub(crate) fn recompute_used(&self) {
        let current = self.mutator_alloc.current();
        let used = self
            .regions
            .iter()
            .filter(|region| !region.is_free() && Some(region.index()) != current)
            .map(|region| region.used())
            .sum();
        self.summary_used.store(used, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn gc_time_stamp(&self) -> u32 {
        self.gc_time_stamp.load(Ordering::Acquire)
    }

    pub(crate) fn increment_gc_time_stamp(&self) -> u32 {
        self.gc_time_stamp.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn increment_total_collections(&self, full: bool) -> usize {
        if full {
            self.full_collections.fetch_add(1, Ordering::AcqRel);
        }
        self.total_collections.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Position of `addr` in heap words, as stored in forwarding marks.
    #[inline(always)]
    pub(crate) fn word_index(&self, addr: Address) -> u32 {
        let index = addr.words_from(self.regions.base());
        debug_assert!(index <= u32::MAX as usize, "word index {} overflows a forwarding mark", index);
        index as u32
    }

    #[inline(always)]
    pub(crate) fn object_at_word(&self, index: u32) -> ObjectRef {
        unsafe { ObjectRef::from_address(self.regions.base().add_words(index as usize)) }
    }

    /// Applies `f` to every strong root slot: global roots, thread roots and providers.
    pub(crate) fn visit_roots(&self, f: &mut dyn FnMut(&mut usize)) {
        self.roots.for_each_slot(|slot| f(slot));
        for roots in self.thread_roots.lock().iter() {
            roots.for_each_slot(|slot| f(slot));
        }
        let mut providers = self.root_providers.lock();
        let mut visitor = RootVisitor::new(f);
        for provider in providers.iter_mut() {
            provider(&mut visitor);
        }
    }

    pub(crate) fn fire_event(&self, event: &GcEvent) {
        {
            let mut stats = self.stats.lock();
            match event {
                GcEvent::PauseEpilogue(summary) => stats.record_pause(summary),
                GcEvent::FullCollection(summary) => stats.record_full_collection(summary),
                GcEvent::ConcurrentCycleEnd { .. } => stats.concurrent_cycles += 1,
                GcEvent::PausePrologue { .. } | GcEvent::ConcurrentCycleStart { .. } => {}
            }
        }
        for listener in self.listeners.read().iter() {
            listener(event);
        }
    }

    /// Stops the world and runs `op` with the heap lock held.
    ///
    /// `participant` tells whether the caller is a registered thread; if another
    /// thread wins the race to stop the world, a participant parks for that pause
    /// and tries again afterwards.
    pub(crate) fn run_at_safepoint<R>(&self, participant: bool, op: impl FnOnce(&mut HeapState) -> R) -> R {
        loop {
            if let Some(scope) = self.safepoint.begin_pause(participant) {
                let result = {
                    let mut state = self.state.lock();
                    op(&mut state)
                };
                drop(scope);
                return result;
            }
            if participant {
                self.safepoint.park();
            } else {
                self.safepoint.wait_while_armed();
            }
        }
    }

    /// Checks the heap. Only at a safepoint.
    pub(crate) fn verify_at_safepoint(&self, state: &HeapState, when: &str) -> RegionCensus {
        let census = verify_heap(self, state);
        log::debug!("verification {}: {:?}", when, census);
        census
    }

    /// Allocation with the heap lock taken. Returns `None` when a pause is due.
    pub(crate) fn attempt_allocation_locked(&self, request: AllocRequest) -> Option<Address> {
        let mut state = self.state.lock();
        match request {
            AllocRequest::Words(words) => {
                if let Some(addr) = self.mutator_alloc.attempt_allocation(&self.regions, words) {
                    return Some(addr);
                }
                if state
                    .policy
                    .should_do_collection_pause(state.young_list.length())
                {
                    return None;
                }
                self.new_mutator_alloc_region(&mut state, words)
            }
            AllocRequest::Humongous(shape) => self.allocate_humongous(shape),
        }
    }

    /// Closes the current mutator region. Its unused tail is filled so that racing
    /// allocators cannot bump it any further.
    pub(crate) fn retire_mutator_alloc_region(&self) {
        let index = match self.mutator_alloc.current() {
            Some(index) => index,
            None => return,
        };
        self.mutator_alloc.set(None);
        let region = self.regions.at(index);
        loop {
            let free = region.free() / HEAP_WORD_SIZE;
            if free == 0 {
                break;
            }
            if let Some(addr) = region.par_allocate(free) {
                fill_range(addr, addr.add_words(free));
            }
        }
        self.summary_used.fetch_add(region.used(), Ordering::AcqRel);
    }

    /// Installs a new mutator region and allocates `words` in it. Heap lock held.
    pub(crate) fn new_mutator_alloc_region(&self, state: &mut HeapState, words: usize) -> Option<Address> {
        self.retire_mutator_alloc_region();
        let index = self.regions.alloc_free_region_from_lists(true)?;
        let HeapState {
            policy, young_list, ..
        } = state;
        young_list.push_region(self.regions.all(), index, policy.surv_rate_group());
        let region = self.regions.at(index);
        // Young cards stay dirty; the post-barrier filters stores into young objects.
        self.card_table.dirty_range(region.bottom(), region.end());
        self.mutator_alloc.set(Some(index));
        region.par_allocate(words)
    }

    /// Heap lock held or at a safepoint.
    pub(crate) fn allocate_humongous(&self, shape: Shape) -> Option<Address> {
        let addr = humongous_obj_allocate(&self.regions, &self.bot, shape)?;
        self.summary_used
            .fetch_add(shape.size_words() * HEAP_WORD_SIZE, Ordering::AcqRel);
        Some(addr)
    }

    fn allocate_at_safepoint(&self, state: &mut HeapState, request: AllocRequest) -> Option<Address> {
        match request {
            AllocRequest::Words(words) => self
                .mutator_alloc
                .attempt_allocation(&self.regions, words)
                .or_else(|| self.new_mutator_alloc_region(state, words)),
            AllocRequest::Humongous(shape) => self.allocate_humongous(shape),
        }
    }

    /// Allocation slow path at a safepoint: collect, expand, compact, expand again.
    pub(crate) fn satisfy_failed_allocation(
        &self,
        state: &mut HeapState,
        gc_count_before: usize,
        request: AllocRequest,
    ) -> AllocOutcome {
        if self.total_collections() != gc_count_before {
            return match self.allocate_at_safepoint(state, request) {
                Some(addr) => AllocOutcome::Allocated(addr),
                None => AllocOutcome::Retry,
            };
        }
        let cause = if request.is_humongous() {
            GcCause::HumongousAllocation
        } else {
            GcCause::AllocationFailure
        };
        crate::pause::do_collection_pause(self, state, cause);
        if let Some(addr) = self.allocate_at_safepoint(state, request) {
            return AllocOutcome::Allocated(addr);
        }
        if self.expand_for(state, request) {
            if let Some(addr) = self.allocate_at_safepoint(state, request) {
                return AllocOutcome::Allocated(addr);
            }
        }
        crate::full_gc::do_full_collection(self, state, GcCause::LastDitch);
        if let Some(addr) = self.allocate_at_safepoint(state, request) {
            return AllocOutcome::Allocated(addr);
        }
        if self.expand_for(state, request) {
            if let Some(addr) = self.allocate_at_safepoint(state, request) {
                return AllocOutcome::Allocated(addr);
            }
        }
        log::error!(
            "out of memory: {} bytes requested, {} used of {}",
            request.words() * HEAP_WORD_SIZE,
            formatted_size(self.used()),
            formatted_size(self.capacity())
        );
        AllocOutcome::OutOfMemory
    }

    fn expand_for(&self, state: &mut HeapState, request: AllocRequest) -> bool {
        let needed = request.regions_needed(self.regions.sizes().region_size_words);
        self.expand(state, needed * self.regions.sizes().region_size_bytes) > 0
    }

    /// Commits at least `bytes` more, rounded up to whole regions. Returns the
    /// number of regions added. Heap lock held.
    pub(crate) fn expand(&self, state: &mut HeapState, bytes: usize) -> usize {
        let region_bytes = self.regions.sizes().region_size_bytes;
        let wanted = (bytes + region_bytes - 1) / region_bytes;
        if wanted == 0 {
            return 0;
        }
        match self.regions.expand_by(wanted) {
            Ok(0) => 0,
            Ok(added) => {
                self.stats.lock().heap_expansions += 1;
                state.policy.calculate_young_list_target_length(
                    self.regions.len(),
                    self.regions.free_regions_count(),
                    state.young_list.length(),
                );
                logln_if!(
                    self.config.verbose,
                    "heap expanded by {} regions to {}",
                    added,
                    formatted_size(self.capacity())
                );
                added
            }
            Err(err) => {
                log::warn!("heap expansion by {} regions failed: {}", wanted, err);
                0
            }
        }
    }

    /// Uncommits up to `bytes` of trailing free regions. Only at a safepoint.
    pub(crate) fn shrink(&self, state: &mut HeapState, bytes: usize) -> usize {
        let region_bytes = self.regions.sizes().region_size_bytes;
        let removed = self.regions.shrink_by(bytes / region_bytes);
        if removed > 0 {
            self.stats.lock().heap_shrinks += 1;
            state.policy.calculate_young_list_target_length(
                self.regions.len(),
                self.regions.free_regions_count(),
                state.young_list.length(),
            );
            logln_if!(
                self.config.verbose,
                "heap shrunk by {} regions to {}",
                removed,
                formatted_size(self.capacity())
            );
        }
        removed
    }
}
