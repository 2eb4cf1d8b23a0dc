//! Heap regions.
//!
//! A region is a fixed-size, contiguous extent of the heap. Region descriptors live
//! in an arena owned by [`RegionDirectory`](crate::region_directory::RegionDirectory)
//! and refer to one another by [`RegionIndex`]; lists thread through the `next`
//! link stored in each descriptor.
//!
//! State machine of the region kind (transitions under the heap lock or at a safepoint):
//!
//! ```text
//!      Free ----> Young ----(pause: evacuated)----> Free
//!       | \         |  \---(pause: evacuation failed)--> Old
//!       |  \        \-----> Survivor ---(pause)---> Free / Old
//!       |   \---> Old (GC allocation for tenured) ---(cleanup, full gc)---> Free
//!       \---> StartsHumongous + ContinuesHumongous* ---(dead)---> Free
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};

use atomic::Atomic;

use crate::address::Address;
use crate::error::{GcError, GcResult};
use crate::globals::{
    align_up, formatted_size, round_down_power_of_2, which_power_of_two, HEAP_WORD_SIZE,
    LOG_HEAP_WORD_SIZE, MAX_REGION_SIZE, MIN_REGION_SIZE, TARGET_REGION_NUMBER,
};
use crate::remset::RememberedSet;

/// Stable identity of a region; its position in the directory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RegionIndex(pub u32);

impl RegionIndex {
    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RegionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) const NO_REGION: u32 = u32::MAX;

#[inline(always)]
pub(crate) fn encode_index(index: Option<RegionIndex>) -> u32 {
    index.map_or(NO_REGION, |i| i.0)
}

#[inline(always)]
pub(crate) fn decode_index(raw: u32) -> Option<RegionIndex> {
    if raw == NO_REGION {
        None
    } else {
        Some(RegionIndex(raw))
    }
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionKind {
    Free,
    Young,
    Survivor,
    Old,
    StartsHumongous,
    ContinuesHumongous,
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ZeroFillState {
    NeedsZeroFill,
    ZeroFilling,
    ZeroFilled,
    Allocated,
}

/// The list a region is currently linked into through its `next` field.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ListTag {
    None,
    Free,
    Unclean,
    Young,
    ScanOnly,
    Survivor,
    CollectionSet,
}

/// Sizes derived from the configured region size.
#[derive(Default, Clone, Copy)]
pub struct RegionSizes {
    pub region_size_bytes: usize,
    pub region_size_words: usize,
    pub region_size_bytes_shift: usize,
    pub region_size_words_shift: usize,
    pub region_count: usize,
    pub humongous_threshold_words: usize,
    pub max_tlab_size_words: usize,
    pub max_heap_size: usize,
}

impl fmt::Debug for RegionSizes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RegionSizes:")?;
        writeln!(f, "\tregion_size_bytes: {}", formatted_size(self.region_size_bytes))?;
        writeln!(f, "\tregion_size_words: {}", self.region_size_words)?;
        writeln!(f, "\tregion_size_bytes_shift: {}", self.region_size_bytes_shift)?;
        writeln!(f, "\tregion_count: {}", self.region_count)?;
        writeln!(
            f,
            "\thumongous_threshold_words: {}",
            self.humongous_threshold_words
        )?;
        writeln!(f, "\tmax_tlab_size_words: {}", self.max_tlab_size_words)?;
        writeln!(f, "\tmax_heap_size: {}", formatted_size(self.max_heap_size))
    }
}

impl RegionSizes {
    pub fn setup(max_heap_size: usize, region_size: Option<usize>) -> GcResult<Self> {
        let region_size = match region_size {
            Some(size) => size,
            None => {
                let size = (max_heap_size / TARGET_REGION_NUMBER)
                    .max(MIN_REGION_SIZE)
                    .min(MAX_REGION_SIZE);
                round_down_power_of_2(size)
            }
        };
        if max_heap_size < region_size {
            return Err(GcError::InvalidConfig(format!(
                "max heap size {} cannot hold a single region of {}",
                formatted_size(max_heap_size),
                formatted_size(region_size)
            )));
        }
        let mut sizes = RegionSizes::default();
        sizes.region_size_bytes = region_size;
        sizes.region_size_bytes_shift = which_power_of_two(region_size);
        sizes.region_size_words = region_size >> LOG_HEAP_WORD_SIZE;
        sizes.region_size_words_shift = sizes.region_size_bytes_shift - LOG_HEAP_WORD_SIZE;
        sizes.max_heap_size = align_up(max_heap_size, region_size);
        sizes.region_count = sizes.max_heap_size / region_size;
        // Anything that does not fit in a single region goes humongous.
        sizes.humongous_threshold_words = sizes.region_size_words;
        sizes.max_tlab_size_words = sizes.region_size_words / 8;
        Ok(sizes)
    }
}

pub struct Region {
    index: RegionIndex,
    bottom: Address,
    end: Address,
    top: AtomicUsize,

    kind: Atomic<RegionKind>,
    zero_fill: Atomic<ZeroFillState>,
    list: Atomic<ListTag>,
    next: AtomicU32,
    /// Head of the humongous run this region belongs to.
    humongous_start: AtomicU32,

    claim_value: AtomicU32,
    in_collection_set: AtomicBool,
    evacuation_failed: AtomicBool,
    popular: AtomicBool,
    popular_pending: AtomicBool,
    scan_only: AtomicBool,

    /// Pause in which this region last became a GC allocation region, and its top then.
    gc_time_stamp: AtomicU32,
    saved_mark: AtomicUsize,

    /// Next top at mark start. Objects at or above it are implicitly live.
    ntams: AtomicUsize,
    marked_bytes: AtomicUsize,

    young_index_in_cset: AtomicI32,
    surv_rate_age: AtomicI32,

    rem_set: RememberedSet,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub fn new(index: RegionIndex, bottom: Address, words: usize, rem_set: RememberedSet) -> Self {
        Self {
            index,
            bottom,
            end: bottom.add_words(words),
            top: AtomicUsize::new(bottom.as_usize()),
            kind: Atomic::new(RegionKind::Free),
            zero_fill: Atomic::new(ZeroFillState::ZeroFilled),
            list: Atomic::new(ListTag::None),
            next: AtomicU32::new(NO_REGION),
            humongous_start: AtomicU32::new(NO_REGION),
            claim_value: AtomicU32::new(0),
            in_collection_set: AtomicBool::new(false),
            evacuation_failed: AtomicBool::new(false),
            popular: AtomicBool::new(false),
            popular_pending: AtomicBool::new(false),
            scan_only: AtomicBool::new(false),
            gc_time_stamp: AtomicU32::new(0),
            saved_mark: AtomicUsize::new(bottom.as_usize()),
            ntams: AtomicUsize::new(bottom.as_usize()),
            marked_bytes: AtomicUsize::new(0),
            young_index_in_cset: AtomicI32::new(-1),
            surv_rate_age: AtomicI32::new(-1),
            rem_set,
        }
    }

    #[inline(always)]
    pub fn index(&self) -> RegionIndex {
        self.index
    }

    #[inline(always)]
    pub fn bottom(&self) -> Address {
        self.bottom
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.end
    }

    #[inline(always)]
    pub fn top(&self) -> Address {
        Address::from_usize(self.top.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn set_top(&self, top: Address) {
        crate::guarantee!(
            self.bottom <= top && top <= self.end,
            "top {:?} outside region {} [{:?}, {:?})",
            top,
            self.index,
            self.bottom,
            self.end
        );
        self.top.store(top.as_usize(), Ordering::Release);
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        self.bottom <= addr && addr < self.end
    }

    pub fn capacity(&self) -> usize {
        self.end - self.bottom
    }

    pub fn used(&self) -> usize {
        self.top() - self.bottom
    }

    pub fn free(&self) -> usize {
        self.end - self.top()
    }

    pub fn is_empty(&self) -> bool {
        self.top() == self.bottom
    }

    /// Lock-free bump allocation, safe against concurrent allocators.
    #[inline]
    pub fn par_allocate(&self, words: usize) -> Option<Address> {
        let bytes = words * HEAP_WORD_SIZE;
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            if self.end.as_usize() - top < bytes {
                return None;
            }
            match self.top.compare_exchange_weak(
                top,
                top + bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(Address::from_usize(top)),
                Err(current) => top = current,
            }
        }
    }

    /// Gives back the most recent allocation if nothing was allocated after it.
    pub fn par_undo_allocation(&self, addr: Address, words: usize) -> bool {
        let end = addr.add_words(words);
        self.top
            .compare_exchange(
                end.as_usize(),
                addr.as_usize(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    #[inline(always)]
    pub fn kind(&self) -> RegionKind {
        self.kind.load(Ordering::Acquire)
    }

    pub fn set_kind(&self, kind: RegionKind) {
        log::trace!("region {}: {:?} -> {:?}", self.index, self.kind(), kind);
        self.kind.store(kind, Ordering::Release);
    }

    pub fn is_free(&self) -> bool {
        self.kind() == RegionKind::Free
    }

    /// Young or survivor.
    pub fn is_young(&self) -> bool {
        matches!(self.kind(), RegionKind::Young | RegionKind::Survivor)
    }

    pub fn is_survivor(&self) -> bool {
        self.kind() == RegionKind::Survivor
    }

    pub fn is_old(&self) -> bool {
        self.kind() == RegionKind::Old
    }

    pub fn is_humongous(&self) -> bool {
        matches!(
            self.kind(),
            RegionKind::StartsHumongous | RegionKind::ContinuesHumongous
        )
    }

    pub fn is_starts_humongous(&self) -> bool {
        self.kind() == RegionKind::StartsHumongous
    }

    pub fn is_continues_humongous(&self) -> bool {
        self.kind() == RegionKind::ContinuesHumongous
    }

    pub fn humongous_start(&self) -> Option<RegionIndex> {
        decode_index(self.humongous_start.load(Ordering::Acquire))
    }

    pub fn set_humongous_start(&self, start: Option<RegionIndex>) {
        self.humongous_start
            .store(encode_index(start), Ordering::Release);
    }

    pub fn zero_fill_state(&self) -> ZeroFillState {
        self.zero_fill.load(Ordering::Acquire)
    }

    /// Only called with the zero-fill lock held.
    pub fn set_zero_fill_state(&self, state: ZeroFillState) {
        self.zero_fill.store(state, Ordering::Release);
    }

    pub fn list_tag(&self) -> ListTag {
        self.list.load(Ordering::Acquire)
    }

    pub(crate) fn set_list_tag(&self, tag: ListTag) {
        self.list.store(tag, Ordering::Release);
    }

    pub(crate) fn next(&self) -> Option<RegionIndex> {
        decode_index(self.next.load(Ordering::Acquire))
    }

    pub(crate) fn set_next(&self, next: Option<RegionIndex>) {
        self.next.store(encode_index(next), Ordering::Release);
    }

    pub fn claim_value(&self) -> u32 {
        self.claim_value.load(Ordering::Acquire)
    }

    pub fn set_claim_value(&self, value: u32) {
        self.claim_value.store(value, Ordering::Release);
    }

    /// Claims the region for the episode identified by `value`. Exactly one caller
    /// per episode sees `true`.
    pub fn claim(&self, value: u32) -> bool {
        let current = self.claim_value.load(Ordering::Acquire);
        current != value
            && self
                .claim_value
                .compare_exchange(current, value, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    pub fn in_collection_set(&self) -> bool {
        self.in_collection_set.load(Ordering::Acquire)
    }

    pub fn set_in_collection_set(&self, value: bool) {
        self.in_collection_set.store(value, Ordering::Release);
    }

    pub fn evacuation_failed(&self) -> bool {
        self.evacuation_failed.load(Ordering::Acquire)
    }

    pub fn set_evacuation_failed(&self, value: bool) {
        self.evacuation_failed.store(value, Ordering::Release);
    }

    pub fn popular(&self) -> bool {
        self.popular.load(Ordering::Acquire)
    }

    pub fn set_popular(&self, value: bool) {
        self.popular.store(value, Ordering::Release);
    }

    pub fn popular_pending(&self) -> bool {
        self.popular_pending.load(Ordering::Acquire)
    }

    pub fn set_popular_pending(&self, value: bool) {
        self.popular_pending.store(value, Ordering::Release);
    }

    pub fn is_scan_only(&self) -> bool {
        self.scan_only.load(Ordering::Acquire)
    }

    pub fn set_scan_only(&self, value: bool) {
        self.scan_only.store(value, Ordering::Release);
    }

    /// Records that this region starts receiving GC copies in pause `stamp`.
    pub fn record_top_and_timestamp(&self, stamp: u32) {
        self.saved_mark
            .store(self.top.load(Ordering::Acquire), Ordering::Release);
        self.gc_time_stamp.store(stamp, Ordering::Release);
    }

    pub fn gc_time_stamp(&self) -> u32 {
        self.gc_time_stamp.load(Ordering::Acquire)
    }

    /// Upper bound for scanning cards of this region during pause `stamp`.
    ///
    /// Regions that became copy destinations in the current pause are only parsable
    /// up to the top they had at that moment.
    pub fn scan_top(&self, stamp: u32) -> Address {
        if self.gc_time_stamp() == stamp {
            Address::from_usize(self.saved_mark.load(Ordering::Acquire))
        } else {
            self.top()
        }
    }

    pub fn ntams(&self) -> Address {
        Address::from_usize(self.ntams.load(Ordering::Acquire))
    }

    pub fn set_ntams(&self, addr: Address) {
        self.ntams.store(addr.as_usize(), Ordering::Release);
    }

    /// Copies made during marking are allocated above NTAMS and therefore live.
    pub fn note_end_of_copying(&self) {
        self.set_ntams(self.top());
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes.load(Ordering::Acquire)
    }

    pub fn add_marked_bytes(&self, bytes: usize) {
        self.marked_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn set_marked_bytes(&self, bytes: usize) {
        self.marked_bytes.store(bytes, Ordering::Release);
    }

    /// Live bytes after a marking cycle: marked below NTAMS plus everything above it.
    pub fn live_bytes(&self) -> usize {
        self.marked_bytes() + (self.top() - self.ntams().max(self.bottom))
    }

    pub fn garbage_bytes(&self) -> usize {
        self.used().saturating_sub(self.live_bytes())
    }

    pub fn young_index_in_cset(&self) -> i32 {
        self.young_index_in_cset.load(Ordering::Acquire)
    }

    pub fn set_young_index_in_cset(&self, index: i32) {
        self.young_index_in_cset.store(index, Ordering::Release);
    }

    pub fn surv_rate_age(&self) -> i32 {
        self.surv_rate_age.load(Ordering::Acquire)
    }

    pub fn set_surv_rate_age(&self, age: i32) {
        self.surv_rate_age.store(age, Ordering::Release);
    }

    pub fn rem_set(&self) -> &RememberedSet {
        &self.rem_set
    }

    /// Turns the region into an old region, leaving its contents in place.
    pub fn set_not_young(&self) {
        self.set_kind(RegionKind::Old);
        self.set_young_index_in_cset(-1);
        self.set_surv_rate_age(-1);
        self.set_scan_only(false);
    }

    /// Resets all per-use state of a region whose contents are garbage.
    pub fn hr_clear(&self, clear_space: bool) {
        self.set_kind(RegionKind::Free);
        self.set_humongous_start(None);
        self.set_in_collection_set(false);
        self.set_evacuation_failed(false);
        self.set_popular(false);
        self.set_popular_pending(false);
        self.set_scan_only(false);
        self.set_young_index_in_cset(-1);
        self.set_surv_rate_age(-1);
        self.set_marked_bytes(0);
        self.set_ntams(self.bottom);
        self.saved_mark
            .store(self.bottom.as_usize(), Ordering::Release);
        self.rem_set.clear();
        if clear_space {
            self.set_top(self.bottom);
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Region {} {:?} [{:?}, {:?}, {:?}) list={:?} cs={} failed={}",
            self.index,
            self.kind(),
            self.bottom,
            self.top(),
            self.end,
            self.list_tag(),
            self.in_collection_set(),
            self.evacuation_failed()
        )
    }
}
