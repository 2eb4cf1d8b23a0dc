//! The regions evacuated by a pause, and the ranked old regions a mixed pause may
//! add to them.

use crate::region::{ListTag, Region, RegionIndex};
use crate::region_list::RegionList;

/// Built fresh by every pause and emptied again before the pause ends.
pub struct CollectionSet {
    regions: RegionList,
    young_regions: usize,
    bytes_used_before: usize,
    predicted_time_ms: f64,
}

impl CollectionSet {
    pub const fn new() -> Self {
        Self {
            regions: RegionList::new(ListTag::CollectionSet),
            young_regions: 0,
            bytes_used_before: 0,
            predicted_time_ms: 0.0,
        }
    }

    pub fn add(&mut self, regions: &[Region], index: RegionIndex, predicted_ms: f64) {
        let region = &regions[index.as_usize()];
        crate::guarantee!(
            !region.in_collection_set() && !region.is_humongous() && !region.popular(),
            "{:?} cannot join the collection set",
            region
        );
        region.set_in_collection_set(true);
        if region.is_young() {
            region.set_young_index_in_cset(self.young_regions as i32);
            self.young_regions += 1;
        }
        self.bytes_used_before += region.used();
        self.predicted_time_ms += predicted_ms;
        self.regions.push_back(regions, index);
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn young_regions(&self) -> usize {
        self.young_regions
    }

    pub fn old_regions(&self) -> usize {
        self.len() - self.young_regions
    }

    pub fn bytes_used_before(&self) -> usize {
        self.bytes_used_before
    }

    pub fn predicted_time_ms(&self) -> f64 {
        self.predicted_time_ms
    }

    pub fn iter<'a>(&self, regions: &'a [Region]) -> impl Iterator<Item = &'a Region> {
        self.regions.iter(regions)
    }

    pub fn indices(&self, regions: &[Region]) -> Vec<RegionIndex> {
        self.regions.iter(regions).map(|r| r.index()).collect()
    }

    /// Unlinks every member, clearing its membership flag.
    pub fn clear(&mut self, regions: &[Region]) -> Vec<RegionIndex> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(index) = self.regions.pop_front(regions) {
            regions[index.as_usize()].set_in_collection_set(false);
            out.push(index);
        }
        self.young_regions = 0;
        self.bytes_used_before = 0;
        self.predicted_time_ms = 0.0;
        out
    }
}

impl Default for CollectionSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Old regions ranked by reclaimable bytes after a marking cycle.
#[derive(Default)]
pub struct CollectionSetChooser {
    candidates: Vec<RegionIndex>,
    cursor: usize,
    /// Candidates per mixed pause, fixed when the list is built.
    per_pause: usize,
}

/// Mixed pauses the candidate list is spread over.
const MIXED_PAUSE_COUNT_TARGET: usize = 8;

impl CollectionSetChooser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ranks `regions` by garbage, most garbage first, dropping those below
    /// `min_garbage_bytes`.
    pub fn build(&mut self, regions: &[Region], mut candidates: Vec<RegionIndex>, min_garbage_bytes: usize) {
        candidates.retain(|index| regions[index.as_usize()].garbage_bytes() >= min_garbage_bytes);
        candidates.sort_by(|a, b| {
            let a = &regions[a.as_usize()];
            let b = &regions[b.as_usize()];
            b.garbage_bytes()
                .cmp(&a.garbage_bytes())
                .then(a.index().cmp(&b.index()))
        });
        self.per_pause = ((candidates.len() + MIXED_PAUSE_COUNT_TARGET - 1) / MIXED_PAUSE_COUNT_TARGET).max(1);
        self.candidates = candidates;
        self.cursor = 0;
    }

    pub fn peek(&self) -> Option<RegionIndex> {
        self.candidates.get(self.cursor).copied()
    }

    pub fn pop(&mut self) -> Option<RegionIndex> {
        let next = self.peek()?;
        self.cursor += 1;
        Some(next)
    }

    pub fn remaining(&self) -> usize {
        self.candidates.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn per_pause(&self) -> usize {
        self.per_pause
    }

    /// Drops candidates that stopped being collectable old regions.
    pub fn prune(&mut self, regions: &[Region]) {
        let rest = self.candidates.split_off(self.cursor);
        self.candidates = rest
            .into_iter()
            .filter(|i| {
                let r = &regions[i.as_usize()];
                r.is_old() && !r.popular() && !r.in_collection_set()
            })
            .collect();
        self.cursor = 0;
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
        self.cursor = 0;
        self.per_pause = 0;
    }
}
