//! Allocation regions.
//!
//! Mutators bump-allocate in a single shared region; GC workers copy into one
//! current region per [`GcAllocPurpose`]. Both fast paths are lock-free CAS bumps
//! on the region's top. Replacing a current region is serialized: by the heap lock
//! for the mutator region and by the GC allocation lock for the purpose regions.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::address::Address;
use crate::block_offset_table::BlockOffsetTable;
use crate::header::initialize_object;
use crate::header::Shape;
use crate::region::{decode_index, encode_index, RegionIndex, RegionKind, NO_REGION};
use crate::region_directory::RegionDirectory;

/// Destination class of an evacuated object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GcAllocPurpose {
    /// Young objects that stay young, copied into survivor regions.
    Survived,
    /// Objects promoted into old regions.
    Tenured,
}

impl GcAllocPurpose {
    pub const ALL: [GcAllocPurpose; 2] = [GcAllocPurpose::Survived, GcAllocPurpose::Tenured];

    #[inline(always)]
    pub const fn index(self) -> usize {
        match self {
            GcAllocPurpose::Survived => 0,
            GcAllocPurpose::Tenured => 1,
        }
    }

    pub const fn region_kind(self) -> RegionKind {
        match self {
            GcAllocPurpose::Survived => RegionKind::Survivor,
            GcAllocPurpose::Tenured => RegionKind::Old,
        }
    }

    pub const fn alternative(self) -> GcAllocPurpose {
        match self {
            GcAllocPurpose::Survived => GcAllocPurpose::Tenured,
            GcAllocPurpose::Tenured => GcAllocPurpose::Survived,
        }
    }
}

/// The region mutators currently allocate in.
pub struct MutatorAllocRegion {
    current: AtomicU32,
}

impl MutatorAllocRegion {
    pub const fn new() -> Self {
        Self {
            current: AtomicU32::new(NO_REGION),
        }
    }

    #[inline(always)]
    pub fn current(&self) -> Option<RegionIndex> {
        decode_index(self.current.load(Ordering::Acquire))
    }

    /// Only with the heap lock held or at a safepoint.
    pub fn set(&self, index: Option<RegionIndex>) {
        self.current.store(encode_index(index), Ordering::Release);
    }

    /// Lock-free attempt in the current region.
    #[inline]
    pub fn attempt_allocation(&self, regions: &RegionDirectory, words: usize) -> Option<Address> {
        let index = self.current()?;
        regions.all()[index.as_usize()].par_allocate(words)
    }
}

impl Default for MutatorAllocRegion {
    fn default() -> Self {
        Self::new()
    }
}

struct GcAllocState {
    budgets: [usize; 2],
    counts: [usize; 2],
    /// Every region that became a GC allocation region during this pause, in order.
    allocated: Vec<(GcAllocPurpose, RegionIndex)>,
    stamp: u32,
}

/// Per-purpose allocation regions used while evacuating.
pub struct GcAllocRegions {
    current: [AtomicU32; 2],
    state: Mutex<GcAllocState>,
}

impl GcAllocRegions {
    pub fn new() -> Self {
        Self {
            current: [AtomicU32::new(NO_REGION), AtomicU32::new(NO_REGION)],
            state: Mutex::new(GcAllocState {
                budgets: [0; 2],
                counts: [0; 2],
                allocated: Vec::new(),
                stamp: 0,
            }),
        }
    }

    /// Arms the allocator for pause `stamp` with per-purpose region budgets,
    /// indexed by [`GcAllocPurpose::index`].
    pub fn prepare(&self, budgets: [usize; 2], stamp: u32) {
        let mut state = self.state.lock();
        crate::guarantee!(
            state.allocated.is_empty(),
            "GC allocation regions left over from the previous pause"
        );
        state.budgets = budgets;
        state.counts = [0; 2];
        state.stamp = stamp;
        self.set_gc_alloc_region(GcAllocPurpose::Survived, None);
        self.set_gc_alloc_region(GcAllocPurpose::Tenured, None);
    }

    pub fn current(&self, purpose: GcAllocPurpose) -> Option<RegionIndex> {
        decode_index(self.current[purpose.index()].load(Ordering::Acquire))
    }

    pub fn set_gc_alloc_region(&self, purpose: GcAllocPurpose, index: Option<RegionIndex>) {
        self.current[purpose.index()].store(encode_index(index), Ordering::Release);
    }

    /// Current region of each purpose, indexed by [`GcAllocPurpose::index`].
    pub fn get_gc_alloc_regions(&self) -> [Option<RegionIndex>; 2] {
        [
            self.current(GcAllocPurpose::Survived),
            self.current(GcAllocPurpose::Tenured),
        ]
    }

    pub fn region_count(&self, purpose: GcAllocPurpose) -> usize {
        self.state.lock().counts[purpose.index()]
    }

    /// Allocates `words` for `purpose`, spilling into the alternative purpose when
    /// the preferred one has no region left. Returns the purpose that satisfied it.
    pub fn par_allocate(
        &self,
        regions: &RegionDirectory,
        bot: &BlockOffsetTable,
        purpose: GcAllocPurpose,
        words: usize,
    ) -> Option<(Address, GcAllocPurpose)> {
        for p in [purpose, purpose.alternative()] {
            if let Some(addr) = self.attempt(regions, p, words) {
                bot.alloc_block(addr, addr.add_words(words));
                return Some((addr, p));
            }
            if let Some(addr) = self.allocate_new_region(regions, p, words) {
                bot.alloc_block(addr, addr.add_words(words));
                return Some((addr, p));
            }
        }
        None
    }

    #[inline]
    fn attempt(&self, regions: &RegionDirectory, purpose: GcAllocPurpose, words: usize) -> Option<Address> {
        let index = self.current(purpose)?;
        regions.all()[index.as_usize()].par_allocate(words)
    }

    fn allocate_new_region(&self, regions: &RegionDirectory, purpose: GcAllocPurpose, words: usize) -> Option<Address> {
        let mut state = self.state.lock();
        // Another worker may have installed a new region while we waited.
        if let Some(addr) = self.attempt(regions, purpose, words) {
            return Some(addr);
        }
        let p = purpose.index();
        if state.counts[p] >= state.budgets[p] {
            return None;
        }
        let index = regions.alloc_free_region_from_lists(false)?;
        let region = regions.at(index);
        region.set_kind(purpose.region_kind());
        region.record_top_and_timestamp(state.stamp);
        state.counts[p] += 1;
        state.allocated.push((purpose, index));
        log::trace!("new {:?} GC allocation region {}", purpose, index);
        let addr = region.par_allocate(words);
        self.set_gc_alloc_region(purpose, Some(index));
        addr
    }

    /// Forgets the current regions and hands back every region allocated during
    /// the pause.
    pub fn release(&self) -> Vec<(GcAllocPurpose, RegionIndex)> {
        let mut state = self.state.lock();
        self.set_gc_alloc_region(GcAllocPurpose::Survived, None);
        self.set_gc_alloc_region(GcAllocPurpose::Tenured, None);
        std::mem::take(&mut state.allocated)
    }
}

impl Default for GcAllocRegions {
    fn default() -> Self {
        Self::new()
    }
}

/// Claims a run of regions for a humongous object of `shape` and writes its header.
///
/// Must be called with the heap lock held. Returns `None` when no run of
/// committed free regions is long enough.
pub fn humongous_obj_allocate(
    regions: &RegionDirectory,
    bot: &BlockOffsetTable,
    shape: Shape,
) -> Option<Address> {
    let words = shape.size_words();
    let region_words = regions.sizes().region_size_words;
    let count = (words + region_words - 1) / region_words;
    let first = regions.alloc_contiguous_free_regions(count)?;
    let start = regions.at(first).bottom();
    let obj_end = start.add_words(words);

    initialize_object(start, shape);
    for i in 0..count {
        let region = regions.at(RegionIndex(first.0 + i as u32));
        region.set_humongous_start(Some(first));
        region.set_top(obj_end.min(region.end()));
        region.set_kind(if i == 0 {
            RegionKind::StartsHumongous
        } else {
            RegionKind::ContinuesHumongous
        });
    }
    bot.alloc_block(start, obj_end);
    log::debug!(
        "humongous object of {} words at {:?} spans regions {}..{}",
        words,
        start,
        first.0,
        first.0 as usize + count
    );
    Some(start)
}
