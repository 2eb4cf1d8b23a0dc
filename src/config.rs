use crate::error::{GcError, GcResult};
use crate::globals::{formatted_size, MAX_AGE, MAX_HEAP_SIZE, MAX_REGION_SIZE, MIN_REGION_SIZE};

/// Collector configuration.
///
/// Defaults mirror the G1 command line flags the collector is modelled on.
#[derive(Clone, Debug)]
pub struct Config {
    /// Heap size committed at startup.
    pub initial_heap_size: usize,
    /// Size of the reserved address range. The heap never grows beyond it.
    pub max_heap_size: usize,
    /// Region size in bytes. Must be a power of two. Derived from the heap size when `None`.
    pub region_size: Option<usize>,
    /// Number of parallel GC worker threads used during pauses.
    pub parallel_gc_threads: usize,

    /// Pause time goal in milliseconds.
    pub max_pause_time_ms: f64,
    /// Confidence (0..100) applied to variance when predicting pause costs.
    pub confidence_percent: u32,
    /// Fixed young list length in regions. Adaptive when `None`.
    pub young_list_length: Option<usize>,
    /// Percentage of the heap kept out of the young generation as evacuation reserve.
    pub min_reserve_percent: usize,
    /// When expanding, grow by this percentage of the uncommitted space.
    pub expand_by_percent_of_available: usize,
    /// Acceptable share of wall time spent in pauses before the heap expands.
    pub gc_percent: usize,
    /// After a full collection, expand when less than this percentage is free.
    pub min_heap_free_ratio: usize,
    /// After a full collection, shrink when more than this percentage is free.
    pub max_heap_free_ratio: usize,

    /// Use thread local allocation buffers for mutator allocation.
    pub use_tlab: bool,
    /// TLAB size in bytes. Region size / 8 when `None`.
    pub tlab_size: Option<usize>,
    /// Size of the per-worker promotion buffers used while evacuating, in bytes.
    pub gc_alloc_buffer_size: usize,
    /// A buffer is retired for an object only if the object is smaller than this
    /// percentage of the buffer; larger objects are allocated directly.
    pub gc_alloc_buffer_waste_percent: usize,
    /// Reference arrays are scanned in chunks of this many elements.
    pub array_scan_chunk: usize,

    /// Copy young survivors into survivor regions instead of tenuring them at once.
    pub use_survivor_space: bool,
    pub survivor_ratio: usize,
    pub target_survivor_ratio: usize,
    pub max_tenuring_threshold: u8,
    /// Always use `max_tenuring_threshold` instead of the age table.
    pub fixed_tenuring_threshold: bool,
    /// Region budget for survivor copies. Derived from the young target when `None`.
    pub max_survivor_regions: Option<usize>,
    /// Region budget for tenured copies. Unlimited when `None`.
    pub max_tenured_regions: Option<usize>,
    /// Keep the oldest young regions as a scan-only prefix instead of evacuating them.
    pub use_scan_only_prefix: bool,

    /// Run concurrent marking cycles.
    pub conc_mark: bool,
    /// Old generation occupancy (percentage of capacity) that starts a marking cycle.
    pub marking_threshold_percent: usize,
    /// Young pauses that must pass between two marking cycles.
    pub min_pauses_between_marks: usize,
    /// Entries in a thread's SATB buffer.
    pub satb_buffer_size: usize,
    /// Completed SATB buffers that wake the concurrent marker.
    pub satb_process_completed_threshold: usize,

    /// Run the concurrent refinement thread. Otherwise cards are refined at pauses only.
    pub conc_refine: bool,
    /// Entries in a thread's dirty card buffer.
    pub update_buffer_size: usize,
    /// Completed dirty card buffers that wake the refinement thread.
    pub dirty_card_queue_max: usize,
    /// log2 of the number of entries in the hot card cache. Zero disables the cache.
    pub conc_rs_log_cache_size: usize,
    /// Refinements of a card after which it is considered hot.
    pub conc_rs_hot_card_limit: u8,
    /// Zero-fill freed regions on a background thread.
    pub conc_zero_fill: bool,
    /// The zero-fill thread keeps at most this many regions on the free list.
    pub conc_zf_max_regions: usize,

    /// log2 of the fine-grained table capacity of a remembered set.
    pub log_rs_region_entries: usize,
    /// Cards per source region kept in the sparse table before going fine-grained.
    pub rs_sparse_entries: usize,
    /// Number of regions reserved for popular objects. Zero disables popularity pauses.
    pub num_popular_regions: usize,
    /// Remembered set occupancy above which a region is considered popular.
    pub rs_pop_limit: usize,
    /// Incoming references above which an object is relocated in a popularity pause.
    pub obj_pop_limit: u32,

    /// Log policy decisions after every pause.
    pub verbose: bool,
    /// Log region transitions.
    pub trace_regions: bool,
    pub verify_before_gc: bool,
    pub verify_after_gc: bool,
}

impl Default for Config {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            initial_heap_size: 64 * 1024 * 1024,
            max_heap_size: 512 * 1024 * 1024,
            region_size: None,
            parallel_gc_threads: threads.min(8),
            max_pause_time_ms: 200.0,
            confidence_percent: 50,
            young_list_length: None,
            min_reserve_percent: 10,
            expand_by_percent_of_available: 20,
            gc_percent: 10,
            min_heap_free_ratio: 40,
            max_heap_free_ratio: 70,
            use_tlab: true,
            tlab_size: None,
            gc_alloc_buffer_size: 8 * 1024,
            gc_alloc_buffer_waste_percent: 10,
            array_scan_chunk: 50,
            use_survivor_space: true,
            survivor_ratio: 8,
            target_survivor_ratio: 50,
            max_tenuring_threshold: MAX_AGE,
            fixed_tenuring_threshold: false,
            max_survivor_regions: None,
            max_tenured_regions: None,
            use_scan_only_prefix: false,
            conc_mark: true,
            marking_threshold_percent: 45,
            min_pauses_between_marks: 2,
            satb_buffer_size: 1024,
            satb_process_completed_threshold: 20,
            conc_refine: true,
            update_buffer_size: 256,
            dirty_card_queue_max: 30,
            conc_rs_log_cache_size: 10,
            conc_rs_hot_card_limit: 4,
            conc_zero_fill: true,
            conc_zf_max_regions: 1,
            log_rs_region_entries: 7,
            rs_sparse_entries: 4,
            num_popular_regions: 0,
            rs_pop_limit: 2048,
            obj_pop_limit: 256,
            verbose: false,
            trace_regions: false,
            verify_before_gc: false,
            verify_after_gc: false,
        }
    }
}

impl Config {
    /// Configuration without background threads. Pause counts and region
    /// transitions only depend on what the calling threads do.
    pub fn deterministic() -> Self {
        Self {
            conc_mark: false,
            conc_refine: false,
            conc_zero_fill: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> GcResult<()> {
        if let Some(size) = self.region_size {
            if !size.is_power_of_two() || size < MIN_REGION_SIZE || size > MAX_REGION_SIZE {
                return Err(GcError::InvalidConfig(format!(
                    "region size {} must be a power of two between {} and {}",
                    formatted_size(size),
                    formatted_size(MIN_REGION_SIZE),
                    formatted_size(MAX_REGION_SIZE)
                )));
            }
        }
        if self.initial_heap_size > self.max_heap_size {
            return Err(GcError::InvalidConfig(format!(
                "initial heap size {} exceeds max heap size {}",
                formatted_size(self.initial_heap_size),
                formatted_size(self.max_heap_size)
            )));
        }
        if self.max_heap_size == 0 {
            return Err(GcError::InvalidConfig("max heap size must be positive".into()));
        }
        if self.max_heap_size as u64 > MAX_HEAP_SIZE {
            return Err(GcError::InvalidConfig(format!(
                "max heap size {} exceeds the addressable {}",
                formatted_size(self.max_heap_size),
                formatted_size(MAX_HEAP_SIZE as usize)
            )));
        }
        if self.parallel_gc_threads == 0 {
            return Err(GcError::InvalidConfig(
                "at least one parallel GC thread is required".into(),
            ));
        }
        if self.max_tenuring_threshold > MAX_AGE {
            return Err(GcError::InvalidConfig(format!(
                "max tenuring threshold {} exceeds {}",
                self.max_tenuring_threshold, MAX_AGE
            )));
        }
        if self.min_heap_free_ratio > self.max_heap_free_ratio || self.max_heap_free_ratio > 100 {
            return Err(GcError::InvalidConfig(format!(
                "heap free ratios {}..{} are inconsistent",
                self.min_heap_free_ratio, self.max_heap_free_ratio
            )));
        }
        if self.array_scan_chunk == 0 || self.update_buffer_size == 0 || self.satb_buffer_size == 0 {
            return Err(GcError::InvalidConfig(
                "chunk and buffer sizes must be positive".into(),
            ));
        }
        if self.conc_rs_log_cache_size > 20 {
            return Err(GcError::InvalidConfig(
                "hot card cache is limited to 2^20 entries".into(),
            ));
        }
        Ok(())
    }
}
