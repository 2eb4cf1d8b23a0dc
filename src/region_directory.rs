//! The region arena.
//!
//! Descriptors for every region of the reserved heap are created up front; only the
//! first `committed` of them are backed by memory. Expansion commits the next
//! regions in index order, so indices stay stable for the lifetime of the heap.
//!
//! Free and unclean (not yet zero-filled) regions sit on two lists protected by
//! the zero-fill lock, which is separate from the heap lock so that the zero-fill
//! thread never contends with pause machinery.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::address::Address;
use crate::error::GcResult;
use crate::globals::{formatted_size, CARD_SHIFT};
use crate::mmap::Mmap;
use crate::region::{ListTag, Region, RegionIndex, RegionKind, RegionSizes, ZeroFillState};
use crate::region_list::RegionList;
use crate::remset::{RememberedSet, RemSetGeometry};

/// Claim value regions hold outside of any parallel iteration.
pub const INITIAL_CLAIM_VALUE: u32 = 0;
pub const RSET_SCAN_CLAIM_VALUE: u32 = 1;
pub const CLEANUP_CLAIM_VALUE: u32 = 2;

pub struct FreeLists {
    pub(crate) free: RegionList,
    pub(crate) unclean: RegionList,
    /// Regions popped by the zero-fill thread and being filled right now.
    pub(crate) zf_in_progress: usize,
    pub(crate) shutdown: bool,
}

pub struct RegionDirectory {
    sizes: RegionSizes,
    reserved: Mmap,
    base: Address,
    regions: Box<[Region]>,
    committed: AtomicUsize,
    lists: Mutex<FreeLists>,
    zf_cond: Condvar,
    conc_zf_max_regions: usize,
}

impl RegionDirectory {
    pub fn new(sizes: RegionSizes, geometry: RemSetGeometry, conc_zf_max_regions: usize) -> GcResult<Self> {
        let reserved = Mmap::reserve(sizes.max_heap_size, sizes.region_size_bytes)?;
        let base = reserved.aligned();
        let regions = (0..sizes.region_count)
            .map(|i| {
                let index = RegionIndex(i as u32);
                Region::new(
                    index,
                    base + i * sizes.region_size_bytes,
                    sizes.region_size_words,
                    RememberedSet::new(index, geometry),
                )
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        log::debug!(
            "reserved {} for {} regions at {:?}\n{:?}",
            formatted_size(sizes.max_heap_size),
            sizes.region_count,
            base,
            sizes
        );
        Ok(Self {
            sizes,
            reserved,
            base,
            regions,
            committed: AtomicUsize::new(0),
            lists: Mutex::new(FreeLists {
                free: RegionList::new(ListTag::Free),
                unclean: RegionList::new(ListTag::Unclean),
                zf_in_progress: 0,
                shutdown: false,
            }),
            zf_cond: Condvar::new(),
            conc_zf_max_regions,
        })
    }

    #[inline(always)]
    pub fn sizes(&self) -> &RegionSizes {
        &self.sizes
    }

    #[inline(always)]
    pub fn base(&self) -> Address {
        self.base
    }

    pub fn reserved_end(&self) -> Address {
        self.base + self.sizes.max_heap_size
    }

    pub fn committed_end(&self) -> Address {
        self.base + self.len() * self.sizes.region_size_bytes
    }

    /// Number of committed regions.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_len(&self) -> usize {
        self.regions.len()
    }

    pub fn committed_bytes(&self) -> usize {
        self.len() * self.sizes.region_size_bytes
    }

    /// All descriptors, committed or not. List operations index into this slice.
    #[inline(always)]
    pub fn all(&self) -> &[Region] {
        &self.regions
    }

    #[inline(always)]
    pub fn at(&self, index: RegionIndex) -> &Region {
        crate::guarantee!(
            index.as_usize() < self.len(),
            "region {} is not committed",
            index
        );
        &self.regions[index.as_usize()]
    }

    #[inline(always)]
    pub fn is_in_reserved(&self, addr: Address) -> bool {
        self.base <= addr && addr < self.reserved_end()
    }

    #[inline(always)]
    pub fn is_in_committed(&self, addr: Address) -> bool {
        self.base <= addr && addr < self.committed_end()
    }

    #[inline(always)]
    pub fn index_of(&self, addr: Address) -> RegionIndex {
        debug_assert!(self.is_in_committed(addr), "{:?} outside committed heap", addr);
        RegionIndex(((addr - self.base) >> self.sizes.region_size_bytes_shift) as u32)
    }

    /// Region containing `addr`. `addr` must lie inside the committed heap.
    #[inline(always)]
    pub fn addr_to_region(&self, addr: Address) -> &Region {
        &self.regions[self.index_of(addr).as_usize()]
    }

    /// Global index of the card containing `addr`.
    #[inline(always)]
    pub fn card_index(&self, addr: Address) -> usize {
        (addr - self.base) >> CARD_SHIFT
    }

    #[inline(always)]
    pub fn card_start(&self, card: usize) -> Address {
        self.base + (card << CARD_SHIFT)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions[..self.len()].iter()
    }

    /// Visits committed regions in index order until `f` returns `false`.
    pub fn iterate(&self, mut f: impl FnMut(&Region) -> bool) {
        for region in self.iter() {
            if !f(region) {
                break;
            }
        }
    }

    /// Claim-based parallel iteration.
    ///
    /// Every worker scans all committed regions starting at an offset derived from its
    /// id and processes the regions it manages to claim with `claim_value`. A worker
    /// that claims a humongous head also claims and processes the whole run of
    /// continuation regions before the head itself.
    pub fn iterate_parallel(
        &self,
        worker_id: usize,
        n_workers: usize,
        claim_value: u32,
        mut f: impl FnMut(&Region),
    ) {
        let n = self.len();
        if n == 0 {
            return;
        }
        let start = (n / n_workers.max(1)) * worker_id % n;
        for count in 0..n {
            let index = (start + count) % n;
            let region = &self.regions[index];
            if region.is_continues_humongous() {
                continue;
            }
            if !region.claim(claim_value) {
                continue;
            }
            if region.is_starts_humongous() {
                for cont in self.regions[index + 1..n].iter() {
                    if !cont.is_continues_humongous()
                        || cont.humongous_start() != Some(region.index())
                    {
                        break;
                    }
                    crate::guarantee!(
                        cont.claim(claim_value),
                        "continues humongous region {} was claimed independently",
                        cont.index()
                    );
                    f(cont);
                }
            }
            f(region);
        }
    }

    pub fn reset_claim_values(&self) {
        for region in self.iter() {
            region.set_claim_value(INITIAL_CLAIM_VALUE);
        }
    }

    pub fn check_claim_values(&self, claim_value: u32) -> bool {
        self.iter().all(|r| r.claim_value() == claim_value)
    }

    /// Commits up to `regions` more regions and puts them on the free list.
    ///
    /// A commit the OS refuses is retried once for a single region. Returns how
    /// many regions were added.
    pub fn expand_by(&self, regions: usize) -> GcResult<usize> {
        let committed = self.len();
        let n = regions.min(self.max_len() - committed);
        if n == 0 {
            return Ok(0);
        }
        let start = self.base + committed * self.sizes.region_size_bytes;
        let n = match self
            .reserved
            .commit(start, n * self.sizes.region_size_bytes)
        {
            Ok(()) => n,
            Err(err) if n > 1 => {
                log::warn!("{}; retrying with a single region", err);
                self.reserved
                    .commit(start, self.sizes.region_size_bytes)?;
                1
            }
            Err(err) => return Err(err),
        };

        let mut lists = self.lists.lock();
        for i in committed..committed + n {
            let region = &self.regions[i];
            region.hr_clear(true);
            region.set_zero_fill_state(ZeroFillState::ZeroFilled);
            lists.free.push_back(&self.regions, region.index());
        }
        self.committed.store(committed + n, Ordering::Release);
        drop(lists);
        self.zf_cond.notify_all();
        log::debug!(
            "expanded heap by {} regions to {}",
            n,
            formatted_size(self.committed_bytes())
        );
        Ok(n)
    }

    /// Uncommits trailing regions that are free, at most `max_regions` of them.
    pub fn shrink_by(&self, max_regions: usize) -> usize {
        let mut lists = self.lists.lock();
        let mut committed = self.len();
        let mut removed = 0;
        while removed < max_regions && committed > 1 {
            let region = &self.regions[committed - 1];
            if !region.is_free() {
                break;
            }
            let index = region.index();
            match region.list_tag() {
                ListTag::Free => {
                    lists.free.remove_if(&self.regions, |r| r.index() == index);
                }
                ListTag::Unclean => {
                    lists.unclean.remove_if(&self.regions, |r| r.index() == index);
                }
                _ => break,
            }
            self.reserved
                .uncommit(region.bottom(), self.sizes.region_size_bytes);
            region.hr_clear(true);
            committed -= 1;
            removed += 1;
        }
        self.committed.store(committed, Ordering::Release);
        removed
    }

    pub fn lock_lists(&self) -> MutexGuard<'_, FreeLists> {
        self.lists.lock()
    }

    /// Takes a region off the free lists for allocation.
    ///
    /// With `zero_filled` the region's memory is guaranteed to read as zero: the free
    /// list is preferred and a region from the unclean list is filled inline. Without
    /// it the unclean list is preferred, leaving filled regions for mutators.
    pub fn alloc_free_region_from_lists(&self, zero_filled: bool) -> Option<RegionIndex> {
        let mut lists = self.lists.lock();
        loop {
            let popped = {
                let lists = &mut *lists;
                let (first, second) = if zero_filled {
                    (&mut lists.free, &mut lists.unclean)
                } else {
                    (&mut lists.unclean, &mut lists.free)
                };
                match first.pop_front(&self.regions) {
                    Some(index) => Some(index),
                    None => second.pop_front(&self.regions),
                }
            };
            match popped {
                Some(index) => {
                    let region = &self.regions[index.as_usize()];
                    if zero_filled && region.zero_fill_state() == ZeroFillState::NeedsZeroFill {
                        zero_fill(region);
                    }
                    region.set_zero_fill_state(ZeroFillState::Allocated);
                    crate::guarantee!(
                        region.is_free() && !region.in_collection_set(),
                        "allocated {:?} from free lists",
                        region
                    );
                    return Some(index);
                }
                None if lists.zf_in_progress > 0 => {
                    self.zf_cond.wait(&mut lists);
                }
                None => return None,
            }
        }
    }

    /// Takes the lowest run of `n` consecutive committed free regions off the lists,
    /// zero-filled. Used for humongous objects.
    pub fn alloc_contiguous_free_regions(&self, n: usize) -> Option<RegionIndex> {
        let mut lists = self.lists.lock();
        // A region being filled is on neither list and would split a run.
        while lists.zf_in_progress > 0 {
            self.zf_cond.wait(&mut lists);
        }
        let committed = self.len();
        let mut run = 0;
        let mut start = 0;
        for i in 0..committed {
            let region = &self.regions[i];
            let listed = matches!(region.list_tag(), ListTag::Free | ListTag::Unclean);
            if region.is_free() && listed {
                if run == 0 {
                    start = i;
                }
                run += 1;
                if run == n {
                    break;
                }
            } else {
                run = 0;
            }
        }
        if n == 0 || run < n {
            return None;
        }
        let range = start..start + n;
        {
            let lists = &mut *lists;
            lists
                .free
                .remove_if(&self.regions, |r| range.contains(&r.index().as_usize()));
            lists
                .unclean
                .remove_if(&self.regions, |r| range.contains(&r.index().as_usize()));
        }
        for region in self.regions[range].iter() {
            if region.zero_fill_state() != ZeroFillState::ZeroFilled {
                zero_fill(region);
            }
            region.set_zero_fill_state(ZeroFillState::Allocated);
        }
        Some(RegionIndex(start as u32))
    }

    /// Returns a region whose contents are dead. It goes to the unclean list.
    pub fn free_region(&self, index: RegionIndex) {
        let region = &self.regions[index.as_usize()];
        region.hr_clear(true);
        region.set_zero_fill_state(ZeroFillState::NeedsZeroFill);
        let mut lists = self.lists.lock();
        lists.unclean.push_front(&self.regions, index);
        drop(lists);
        self.zf_cond.notify_all();
    }

    /// Frees a batch of regions under a single lock acquisition.
    pub fn free_regions(&self, indices: &[RegionIndex]) {
        if indices.is_empty() {
            return;
        }
        let mut lists = self.lists.lock();
        for index in indices {
            let region = &self.regions[index.as_usize()];
            region.hr_clear(true);
            region.set_zero_fill_state(ZeroFillState::NeedsZeroFill);
            lists.unclean.push_front(&self.regions, *index);
        }
        drop(lists);
        self.zf_cond.notify_all();
    }

    /// Rebuilds both lists from the region kinds. Only at a safepoint.
    pub fn rebuild_free_lists(&self) {
        let mut lists = self.lists.lock();
        crate::guarantee!(lists.zf_in_progress == 0, "zero fill in progress during rebuild");
        lists.free.clear(&self.regions);
        lists.unclean.clear(&self.regions);
        for region in self.iter() {
            if !region.is_free() {
                continue;
            }
            if region.list_tag() != ListTag::None {
                continue;
            }
            match region.zero_fill_state() {
                ZeroFillState::ZeroFilled => lists.free.push_back(&self.regions, region.index()),
                _ => {
                    region.set_zero_fill_state(ZeroFillState::NeedsZeroFill);
                    lists.unclean.push_back(&self.regions, region.index())
                }
            }
        }
        drop(lists);
        self.zf_cond.notify_all();
    }

    pub fn free_list_len(&self) -> usize {
        self.lists.lock().free.len()
    }

    pub fn unclean_list_len(&self) -> usize {
        self.lists.lock().unclean.len()
    }

    /// Regions on either list.
    pub fn free_regions_count(&self) -> usize {
        let lists = self.lists.lock();
        lists.free.len() + lists.unclean.len()
    }

    /// Free regions plus regions that could still be committed.
    pub fn available_regions(&self) -> usize {
        self.free_regions_count() + (self.max_len() - self.len())
    }

    fn should_zero_fill(&self, lists: &FreeLists) -> bool {
        !lists.unclean.is_empty() && lists.free.len() < self.conc_zf_max_regions
    }

    /// Blocks until the zero-fill thread has work or shutdown is requested.
    /// Returns false on shutdown.
    pub fn wait_for_zero_fill_work(&self) -> bool {
        let mut lists = self.lists.lock();
        while !lists.shutdown && !self.should_zero_fill(&lists) {
            self.zf_cond.wait(&mut lists);
        }
        !lists.shutdown
    }

    /// Pops an unclean region for the zero-fill thread, if one is still wanted.
    pub fn take_region_for_zero_fill(&self) -> Option<RegionIndex> {
        let mut lists = self.lists.lock();
        if !self.should_zero_fill(&lists) {
            return None;
        }
        let index = lists.unclean.pop_front(&self.regions)?;
        let region = &self.regions[index.as_usize()];
        match region.zero_fill_state() {
            ZeroFillState::ZeroFilled => {
                lists.free.push_back(&self.regions, index);
                None
            }
            _ => {
                region.set_zero_fill_state(ZeroFillState::ZeroFilling);
                lists.zf_in_progress += 1;
                Some(index)
            }
        }
    }

    /// Fills a region taken with `take_region_for_zero_fill` and moves it to the free list.
    pub fn zero_fill_and_release(&self, index: RegionIndex) {
        let region = &self.regions[index.as_usize()];
        zero_fill(region);
        let mut lists = self.lists.lock();
        self.move_cleaned_to_free_locked(&mut lists, index);
        lists.zf_in_progress -= 1;
        drop(lists);
        self.zf_cond.notify_all();
    }

    fn move_cleaned_to_free_locked(&self, lists: &mut FreeLists, index: RegionIndex) {
        let region = &self.regions[index.as_usize()];
        region.set_zero_fill_state(ZeroFillState::ZeroFilled);
        lists.free.push_back(&self.regions, index);
    }

    /// Zero-fills every unclean region inline and moves it to the free list.
    pub fn move_cleaned_to_free(&self) -> usize {
        let mut lists = self.lists.lock();
        let mut moved = 0;
        while let Some(index) = lists.unclean.pop_front(&self.regions) {
            let region = &self.regions[index.as_usize()];
            if region.zero_fill_state() != ZeroFillState::ZeroFilled {
                zero_fill(region);
            }
            self.move_cleaned_to_free_locked(&mut lists, index);
            moved += 1;
        }
        moved
    }

    pub fn request_zero_fill_shutdown(&self) {
        self.lists.lock().shutdown = true;
        self.zf_cond.notify_all();
    }

    pub fn notify_zero_fill(&self) {
        self.zf_cond.notify_all();
    }

    /// Checks that both lists are well formed, hold only free regions and share none.
    pub fn verify_lists(&self) -> (usize, usize) {
        let lists = self.lists.lock();
        crate::guarantee!(
            lists.free.check_well_formed(&self.regions),
            "free list is malformed"
        );
        crate::guarantee!(
            lists.unclean.check_well_formed(&self.regions),
            "unclean list is malformed"
        );
        for region in lists.free.iter(&self.regions) {
            crate::guarantee!(
                region.kind() == RegionKind::Free && region.zero_fill_state() == ZeroFillState::ZeroFilled,
                "{:?} on free list",
                region
            );
        }
        for region in lists.unclean.iter(&self.regions) {
            crate::guarantee!(region.kind() == RegionKind::Free, "{:?} on unclean list", region);
        }
        (lists.free.len(), lists.unclean.len())
    }
}

fn zero_fill(region: &Region) {
    unsafe {
        std::ptr::write_bytes(region.bottom().to_mut_ptr::<u8>(), 0, region.capacity());
    }
}

impl Drop for RegionDirectory {
    fn drop(&mut self) {
        let lists = self.lists.get_mut();
        lists.free.clear(&self.regions);
        lists.unclean.clear(&self.regions);
    }
}
