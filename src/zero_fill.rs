//! Background zero-filling of freed regions.
//!
//! Regions freed by pauses and cleanup land on the unclean list. This thread keeps
//! a few of them zero-filled on the free list so that mutators rarely have to
//! clear a region inline when they take a new allocation region.

use std::sync::Arc;

use crate::heap::Heap;

pub(crate) fn zero_fill_thread(heap: Arc<Heap>) {
    heap.safepoint.register();
    log::debug!("zero-fill thread started");
    let mut filled = 0usize;
    loop {
        {
            let _safe = heap.safepoint.enter_safe_region();
            if !heap.regions.wait_for_zero_fill_work() {
                break;
            }
        }
        while let Some(index) = heap.regions.take_region_for_zero_fill() {
            heap.regions.zero_fill_and_release(index);
            filled += 1;
            if heap.safepoint.is_armed() {
                heap.safepoint.park();
            }
        }
        if heap.is_shutting_down() {
            break;
        }
    }
    log::debug!("zero-fill thread stopped after filling {} regions", filled);
    heap.safepoint.unregister();
}
