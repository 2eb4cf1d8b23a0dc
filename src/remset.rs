//! Per-region remembered sets.
//!
//! A remembered set records the cards, in other regions, that may hold a pointer into
//! its owning region. Entries are kept at three granularities:
//!
//! - sparse: a handful of card indices per source region,
//! - fine: one bit per card of a source region,
//! - coarse: one bit per source region, meaning "every card of that region".
//!
//! Precision drops as the set grows but no entry is ever lost; stale entries are
//! tolerated and filtered when the cards are scanned.

use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::RandomState;
use bit_vec::BitVec;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::region::RegionIndex;

/// Geometry shared by all remembered sets of a heap.
#[derive(Clone, Copy, Debug)]
pub struct RemSetGeometry {
    pub cards_per_region: usize,
    pub sparse_entries: usize,
    pub fine_entries: usize,
}

struct OtherRegionsTable {
    sparse: HashMap<u32, Vec<u32>, RandomState>,
    fine: HashMap<u32, (BitVec, usize), RandomState>,
    coarse: BitVec,
    coarse_count: usize,
}

impl OtherRegionsTable {
    fn new() -> Self {
        Self {
            sparse: HashMap::with_hasher(RandomState::new()),
            fine: HashMap::with_hasher(RandomState::new()),
            coarse: BitVec::new(),
            coarse_count: 0,
        }
    }

    fn is_coarse(&self, region: u32) -> bool {
        self.coarse.get(region as usize).unwrap_or(false)
    }

    fn set_coarse(&mut self, region: u32) {
        let index = region as usize;
        if self.coarse.len() <= index {
            self.coarse.grow(index + 1 - self.coarse.len(), false);
        }
        self.coarse.set(index, true);
        self.coarse_count += 1;
    }
}

pub struct RememberedSet {
    owner: RegionIndex,
    geometry: RemSetGeometry,
    table: Mutex<OtherRegionsTable>,
    occupied: AtomicUsize,
}

impl RememberedSet {
    pub fn new(owner: RegionIndex, geometry: RemSetGeometry) -> Self {
        Self {
            owner,
            geometry,
            table: Mutex::new(OtherRegionsTable::new()),
            occupied: AtomicUsize::new(0),
        }
    }

    pub fn owner(&self) -> RegionIndex {
        self.owner
    }

    /// Records that `card` (a global card index) may point into the owner.
    /// Returns true if the entry was not already covered.
    pub fn add_reference(&self, card: usize) -> bool {
        let cpr = self.geometry.cards_per_region;
        let from = (card / cpr) as u32;
        let offset = (card % cpr) as u32;
        if from == self.owner.0 {
            return false;
        }

        let mut table = self.table.lock();
        if table.is_coarse(from) {
            return false;
        }

        if let Some((bits, count)) = table.fine.get_mut(&from) {
            if bits.get(offset as usize) == Some(true) {
                return false;
            }
            bits.set(offset as usize, true);
            *count += 1;
            self.occupied.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let sparse_entries = self.geometry.sparse_entries;
        let entry = table.sparse.entry(from).or_insert_with(Vec::new);
        if entry.contains(&offset) {
            return false;
        }
        if entry.len() < sparse_entries {
            entry.push(offset);
            self.occupied.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        // Sparse entry overflowed: promote it to a fine bitmap.
        let cards = table.sparse.remove(&from).unwrap_or_default();
        if table.fine.len() >= self.geometry.fine_entries {
            self.coarsen_one(&mut table);
        }
        let mut bits = BitVec::from_elem(cpr, false);
        for c in cards.iter() {
            bits.set(*c as usize, true);
        }
        bits.set(offset as usize, true);
        let count = cards.len() + 1;
        table.fine.insert(from, (bits, count));
        self.occupied.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Replaces the most occupied fine entry by a coarse bit.
    fn coarsen_one(&self, table: &mut OtherRegionsTable) {
        let victim = table
            .fine
            .iter()
            .max_by_key(|(_, (_, count))| *count)
            .map(|(region, (_, count))| (*region, *count));
        if let Some((region, count)) = victim {
            table.fine.remove(&region);
            table.set_coarse(region);
            let cpr = self.geometry.cards_per_region;
            self.occupied.fetch_add(cpr - count, Ordering::Relaxed);
        }
    }

    pub fn contains_reference(&self, card: usize) -> bool {
        let cpr = self.geometry.cards_per_region;
        let from = (card / cpr) as u32;
        let offset = (card % cpr) as u32;
        let table = self.table.lock();
        if table.is_coarse(from) {
            return true;
        }
        if let Some((bits, _)) = table.fine.get(&from) {
            return bits.get(offset as usize) == Some(true);
        }
        table
            .sparse
            .get(&from)
            .map_or(false, |cards| cards.contains(&offset))
    }

    /// Number of cards covered.
    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    /// Snapshot of every card covered, as global card indices.
    pub fn cards(&self) -> Vec<usize> {
        let cpr = self.geometry.cards_per_region;
        let table = self.table.lock();
        let mut out = Vec::with_capacity(self.occupied());
        for (from, cards) in table.sparse.iter() {
            let base = *from as usize * cpr;
            out.extend(cards.iter().map(|c| base + *c as usize));
        }
        for (from, (bits, _)) in table.fine.iter() {
            let base = *from as usize * cpr;
            out.extend(
                bits.iter()
                    .enumerate()
                    .filter(|(_, set)| *set)
                    .map(|(c, _)| base + c),
            );
        }
        for (from, set) in table.coarse.iter().enumerate() {
            if set {
                let base = from * cpr;
                out.extend(base..base + cpr);
            }
        }
        out
    }

    /// Regions that have at least one entry here.
    pub fn source_regions(&self) -> Vec<RegionIndex> {
        let table = self.table.lock();
        let mut out: Vec<RegionIndex> = table
            .sparse
            .keys()
            .chain(table.fine.keys())
            .map(|r| RegionIndex(*r))
            .collect();
        out.extend(
            table
                .coarse
                .iter()
                .enumerate()
                .filter(|(_, set)| *set)
                .map(|(r, _)| RegionIndex(r as u32)),
        );
        out.sort();
        out
    }

    pub fn coarse_regions(&self) -> usize {
        self.table.lock().coarse_count
    }

    pub fn clear(&self) {
        let mut table = self.table.lock();
        table.sparse.clear();
        table.fine.clear();
        table.coarse.clear();
        table.coarse.truncate(0);
        table.coarse_count = 0;
        self.occupied.store(0, Ordering::Relaxed);
    }
}
