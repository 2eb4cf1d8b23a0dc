//! The young generation.
//!
//! Regions enter the young list as mutator allocation regions and leave it when a
//! pause builds its collection set. During the pause, regions flagged scan-only are
//! diverted into a side list instead of being collected, and survivor regions
//! receiving copies are gathered in a third list. Once the pause is over,
//! [`YoungList::reset_auxiliary_lists`] turns the survivors and the scan-only prefix
//! into the next young list.

use crate::policy::predictor::SurvRateGroup;
use crate::region::{ListTag, Region, RegionIndex, RegionKind};
use crate::region_list::RegionList;

pub struct YoungList {
    young: RegionList,
    scan_only: RegionList,
    survivors: RegionList,
}

impl YoungList {
    pub const fn new() -> Self {
        Self {
            young: RegionList::new(ListTag::Young),
            scan_only: RegionList::new(ListTag::ScanOnly),
            survivors: RegionList::new(ListTag::Survivor),
        }
    }

    /// Prepends a fresh mutator allocation region.
    pub fn push_region(&mut self, regions: &[Region], index: RegionIndex, surv_rate: &mut SurvRateGroup) {
        let region = &regions[index.as_usize()];
        crate::guarantee!(
            !region.is_young() && region.list_tag() == ListTag::None,
            "{:?} pushed on the young list twice",
            region
        );
        region.set_kind(RegionKind::Young);
        region.set_scan_only(false);
        region.set_surv_rate_age(surv_rate.next_age_index());
        self.young.push_front(regions, index);
    }

    /// Detaches the head of the young list. Regions flagged scan-only are moved to
    /// the scan-only list, in order, and skipped.
    pub fn pop_region(&mut self, regions: &[Region]) -> Option<RegionIndex> {
        while let Some(index) = self.young.pop_front(regions) {
            if regions[index.as_usize()].is_scan_only() {
                self.scan_only.push_back(regions, index);
            } else {
                return Some(index);
            }
        }
        None
    }

    /// Flags the `count` oldest young regions, which sit at the tail of the list.
    pub fn mark_scan_only_prefix(&mut self, regions: &[Region], count: usize) -> usize {
        let len = self.young.len();
        let skip = len.saturating_sub(count);
        let mut marked = 0;
        for region in self.young.iter(regions).skip(skip) {
            region.set_scan_only(true);
            marked += 1;
        }
        marked
    }

    /// Records a region that received survivor copies during the current pause.
    pub fn add_survivor_region(&mut self, regions: &[Region], index: RegionIndex) {
        let region = &regions[index.as_usize()];
        crate::guarantee!(region.is_survivor(), "{:?} is not a survivor region", region);
        self.survivors.push_back(regions, index);
    }

    /// Rebuilds the young list from the survivors followed by the scan-only prefix,
    /// youngest first. Scan-only regions keep their contents and become survivors.
    pub fn reset_auxiliary_lists(&mut self, regions: &[Region], surv_rate: &mut SurvRateGroup) {
        crate::guarantee!(self.young.is_empty(), "young list should be empty");
        surv_rate.start_adding_regions();
        let mut rebuilt = RegionList::new(ListTag::Young);
        while let Some(index) = self.survivors.pop_front(regions) {
            regions[index.as_usize()].set_surv_rate_age(-1);
            rebuilt.push_back(regions, index);
        }
        while let Some(index) = self.scan_only.pop_front(regions) {
            let region = &regions[index.as_usize()];
            region.set_scan_only(false);
            region.set_kind(RegionKind::Survivor);
            region.set_surv_rate_age(-1);
            rebuilt.push_back(regions, index);
        }
        self.young = rebuilt;
    }

    /// Detaches every young, scan-only and survivor region. Used by full collections,
    /// after which every non-empty region is old.
    pub fn empty_list(&mut self, regions: &[Region]) -> Vec<RegionIndex> {
        let mut out = Vec::with_capacity(self.length());
        for list in [&mut self.young, &mut self.scan_only, &mut self.survivors] {
            while let Some(index) = list.pop_front(regions) {
                out.push(index);
            }
        }
        out
    }

    /// Number of young regions, survivors and scan-only regions included.
    pub fn length(&self) -> usize {
        self.young.len() + self.scan_only.len() + self.survivors.len()
    }

    pub fn young_length(&self) -> usize {
        self.young.len()
    }

    pub fn scan_only_length(&self) -> usize {
        self.scan_only.len()
    }

    pub fn survivor_length(&self) -> usize {
        self.survivors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.young.is_empty()
    }

    pub fn first_region(&self) -> Option<RegionIndex> {
        self.young.head()
    }

    pub fn iter<'a>(&self, regions: &'a [Region]) -> impl Iterator<Item = &'a Region> {
        self.young.iter(regions)
    }

    pub fn scan_only_iter<'a>(&self, regions: &'a [Region]) -> impl Iterator<Item = &'a Region> {
        self.scan_only.iter(regions)
    }

    pub fn survivor_iter<'a>(&self, regions: &'a [Region]) -> impl Iterator<Item = &'a Region> {
        self.survivors.iter(regions)
    }

    /// Every node is young and not scan-only, and the length counter matches a recount.
    pub fn check_list_well_formed(&self, regions: &[Region]) -> bool {
        let mut ok = self.young.check_well_formed(regions);
        for region in self.young.iter(regions) {
            if !region.is_young() || region.is_scan_only() {
                log::error!("young list holds {:?}", region);
                ok = false;
            }
        }
        ok = ok
            && self.scan_only.check_well_formed(regions)
            && self.survivors.check_well_formed(regions);
        if !ok {
            log::error!(
                "young list is not well formed: {} young, {} scan-only, {} survivors",
                self.young.len(),
                self.scan_only.len(),
                self.survivors.len()
            );
        }
        ok
    }

    pub fn check_list_empty(&self) -> bool {
        self.young.is_empty() && self.scan_only.is_empty() && self.survivors.is_empty()
    }
}

impl Default for YoungList {
    fn default() -> Self {
        Self::new()
    }
}
