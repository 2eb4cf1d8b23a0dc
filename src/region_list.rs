use crate::region::{ListTag, Region, RegionIndex};

/// Singly linked list of regions threaded through each region's `next` link.
///
/// The list itself only stores head, tail and length; the links live in the region
/// descriptors. A region carries the tag of the list it is on, and pushing a region
/// that is already on some list is an invariant violation.
#[derive(Clone, Debug)]
pub struct RegionList {
    tag: ListTag,
    head: Option<RegionIndex>,
    tail: Option<RegionIndex>,
    len: usize,
}

impl RegionList {
    pub const fn new(tag: ListTag) -> Self {
        Self {
            tag,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn tag(&self) -> ListTag {
        self.tag
    }

    pub fn head(&self) -> Option<RegionIndex> {
        self.head
    }

    pub fn tail(&self) -> Option<RegionIndex> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn link(&self, region: &Region) {
        crate::guarantee!(
            region.list_tag() == ListTag::None,
            "region {} pushed on {:?} list while on {:?} list",
            region.index(),
            self.tag,
            region.list_tag()
        );
        region.set_list_tag(self.tag);
    }

    pub fn push_front(&mut self, regions: &[Region], index: RegionIndex) {
        let region = &regions[index.as_usize()];
        self.link(region);
        region.set_next(self.head);
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
        self.len += 1;
    }

    pub fn push_back(&mut self, regions: &[Region], index: RegionIndex) {
        let region = &regions[index.as_usize()];
        self.link(region);
        region.set_next(None);
        match self.tail {
            Some(tail) => regions[tail.as_usize()].set_next(Some(index)),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    pub fn pop_front(&mut self, regions: &[Region]) -> Option<RegionIndex> {
        let index = self.head?;
        let region = &regions[index.as_usize()];
        crate::guarantee!(
            region.list_tag() == self.tag,
            "region {} at head of {:?} list is tagged {:?}",
            index,
            self.tag,
            region.list_tag()
        );
        self.head = region.next();
        if self.head.is_none() {
            self.tail = None;
        }
        region.set_next(None);
        region.set_list_tag(ListTag::None);
        self.len -= 1;
        Some(index)
    }

    /// Moves every region of `other` to the end of this list, retagging them.
    pub fn append(&mut self, regions: &[Region], other: &mut RegionList) {
        while let Some(index) = other.pop_front(regions) {
            self.push_back(regions, index);
        }
    }

    /// Unlinks every region for which `f` returns true, preserving the order of the rest.
    pub fn remove_if(&mut self, regions: &[Region], mut f: impl FnMut(&Region) -> bool) -> usize {
        let mut kept = RegionList::new(self.tag);
        let mut removed = 0;
        while let Some(index) = self.pop_front(regions) {
            if f(&regions[index.as_usize()]) {
                removed += 1;
            } else {
                kept.push_back(regions, index);
            }
        }
        *self = kept;
        removed
    }

    /// Detaches all regions, leaving them untagged.
    pub fn clear(&mut self, regions: &[Region]) {
        while self.pop_front(regions).is_some() {}
    }

    pub fn iter<'a>(&self, regions: &'a [Region]) -> RegionListIter<'a> {
        RegionListIter {
            regions,
            cur: self.head,
        }
    }

    pub fn contains(&self, regions: &[Region], index: RegionIndex) -> bool {
        self.iter(regions).any(|r| r.index() == index)
    }

    /// Re-counts the list and checks every node carries this list's tag.
    pub fn check_well_formed(&self, regions: &[Region]) -> bool {
        let mut count = 0;
        let mut last = None;
        for region in self.iter(regions) {
            if region.list_tag() != self.tag || count > regions.len() {
                return false;
            }
            count += 1;
            last = Some(region.index());
        }
        count == self.len && last == self.tail
    }
}

pub struct RegionListIter<'a> {
    regions: &'a [Region],
    cur: Option<RegionIndex>,
}

impl<'a> Iterator for RegionListIter<'a> {
    type Item = &'a Region;

    fn next(&mut self) -> Option<&'a Region> {
        let index = self.cur?;
        let region = &self.regions[index.as_usize()];
        self.cur = region.next();
        Some(region)
    }
}
