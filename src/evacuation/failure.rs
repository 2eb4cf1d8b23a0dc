//! Evacuation failure.
//!
//! When no destination region is left for a copy, the object is forwarded to
//! itself and its region is flagged. Evacuation carries on: the object's referents
//! are still traced, references to it simply keep pointing at the old location.
//! After the workers are done, every flagged region is walked once. Objects that
//! stayed get their mark back and have their outgoing references recorded in the
//! remembered sets; everything else in the region is dead and turned into filler.
//! The region itself is kept as an old region.

use super::scan_state::{ScanState, ScanTask};
use crate::header::{fill_range, load_slot, walk_objects, ForwardingState, MarkWord, ObjectRef};
use crate::heap::Heap;
use crate::refine::record_reference;
use crate::region::{Region, RegionIndex};

impl ScanState<'_> {
    /// Forwards `obj` to itself. Returns the object's final location, which is the
    /// copy made by another worker if it won the race.
    pub(super) fn handle_evacuation_failure(&mut self, obj: ObjectRef, from: &Region) -> ObjectRef {
        // Flag first: workers that see the self-forwarding mark must also see the flag.
        self.failed_region(from);
        match obj.forward_atomic(MarkWord::self_forwarded()) {
            Ok(prev) => {
                if prev.must_be_preserved() {
                    self.stats.preserved_marks.push((obj, prev));
                }
                self.stats.self_forwarded += 1;
                self.push_on_failure_stack(obj);
                obj
            }
            Err(winner) => self.resolve(obj, winner),
        }
    }

    fn push_on_failure_stack(&mut self, obj: ObjectRef) {
        self.failure_stack.push(obj);
        if self.draining_failure_stack {
            return;
        }
        self.draining_failure_stack = true;
        while let Some(obj) = self.failure_stack.pop() {
            for slot in obj.slots() {
                self.push_task(ScanTask::Slot(slot));
            }
        }
        self.draining_failure_stack = false;
    }
}

/// Walks the flagged regions of the collection set once evacuation is over.
///
/// Returns the number of regions that failed.
pub(crate) fn remove_self_forwarding_pointers(heap: &Heap, cset: &[RegionIndex], marking: bool) -> usize {
    let mut failed = 0;
    for index in cset.iter() {
        let region = heap.regions.at(*index);
        if !region.evacuation_failed() {
            continue;
        }
        failed += 1;
        let mut kept_words = 0;
        let mut dead_words = 0;
        walk_objects(region.bottom(), region.top(), |obj| {
            let end = obj.end();
            match obj.forwarding_state() {
                ForwardingState::SelfForwarded => {
                    obj.set_mark(MarkWord::prototype());
                    for slot in obj.slots() {
                        if let Some(value) = load_slot(slot) {
                            record_reference(heap, slot, value);
                        }
                    }
                    if marking {
                        heap.marker.mark_in_place_and_push(obj);
                    }
                    kept_words += obj.size_words();
                }
                ForwardingState::ForwardedTo(_) | ForwardingState::NotForwarded => {
                    if marking {
                        heap.marker.bitmap().clear(obj.address());
                    }
                    dead_words += obj.size_words();
                    fill_range(obj.address(), end);
                }
            }
            heap.bot.alloc_block(obj.address(), end);
        });
        if marking {
            region.note_end_of_copying();
        }
        log::debug!(
            "region {} failed evacuation: kept {} words, {} words dead",
            region.index(),
            kept_words,
            dead_words
        );
    }
    failed
}

/// Puts back the marks that self-forwarding overwrote.
pub(crate) fn restore_preserved_marks(marks: Vec<(ObjectRef, MarkWord)>) {
    for (obj, mark) in marks {
        obj.set_mark(mark);
    }
}
